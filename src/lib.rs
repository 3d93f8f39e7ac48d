#![cfg_attr(not(test), no_std)]
#![doc = include_str!("../README.md")]

// This mod MUST go first, so that the others see its macros.
pub(crate) mod fmt;

mod utils;

pub mod bus;
pub mod gyro;
pub mod ois;
pub mod panel;

// Reexports
#[cfg(feature = "time")]
pub use embassy_time::Delay;
