#![no_std]

pub mod rate_limit;
pub mod replay;
