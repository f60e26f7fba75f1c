#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod debug;
pub mod nodes;

pub use self::{
    debug::{DebugPod, DebugPods, RetryBudget},
    nodes::{node_group, ClusterNodes},
};
pub use k8s_openapi::api::core::v1::{Namespace, Node, Pod};
pub use kube::{
    api::{Api, ObjectMeta},
    Client,
};
