//! Node selection for RPC clients
pub mod load_balancer;

pub use load_balancer::{LoadBalancer, RefreshHandle};
pub use rpc_core::LoadBalancingStrategy;
