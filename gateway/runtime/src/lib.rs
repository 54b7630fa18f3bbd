#![deny(rust_2018_idioms)]
#![forbid(unsafe_code)]

pub use plugin_gateway_core as core;
pub use plugin_gateway_k8s_api as k8s;
pub use plugin_gateway_k8s_cluster as cluster;
pub use plugin_gateway_service as service;

mod args;

pub use self::args::Args;
