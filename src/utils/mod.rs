pub mod deviation;
pub mod random;
