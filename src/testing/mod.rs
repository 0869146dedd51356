//! Test doubles for exercising the device runtime without a broker

pub mod mocks;

pub use mocks::*;
