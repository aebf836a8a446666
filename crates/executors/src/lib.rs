pub mod apply;
pub mod client;
pub mod generator;
pub mod ops;
pub mod tools;
