pub mod base_model;
pub mod forest;
pub mod sampler;
pub mod tree;
