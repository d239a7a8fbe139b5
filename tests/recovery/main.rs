#[path = "../common/mod.rs"]
mod common;

mod redelivery;
mod restart;
