//! Architecture-specific context switching.
//!
//! Each backend provides:
//! - `Context`: saved callee-saved CPU state for one fiber
//! - `context_switch`: save into one context, restore from another
//! - `stack_pointer`: read the live stack pointer register

#[cfg(target_arch = "x86_64")]
mod x86_64;
#[cfg(target_arch = "x86_64")]
pub use x86_64::*;

#[cfg(target_arch = "aarch64")]
mod aarch64;
#[cfg(target_arch = "aarch64")]
pub use aarch64::*;

#[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
compile_error!("context switching is only implemented for x86_64 and aarch64");
