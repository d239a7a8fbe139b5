#[path = "../common/mod.rs"]
mod common;

mod compare_exchange;
mod replicas;
mod transactions;
