//! Atomic types of the Petrel VM.
//!
//! This crate defines the contract between the Petrel front-end compiler and
//! the interpreter core: the opcode set, the variable-length immediate
//! encoding, and the immutable compiled-program object model. It contains no
//! interpreter logic.

#![cfg_attr(not(feature = "std"), no_std)]
#![warn(missing_docs)]
#![deny(unsafe_code)]
#![deny(unused_must_use)]
#![deny(
    clippy::arithmetic_side_effects,
    clippy::cast_sign_loss,
    clippy::cast_possible_truncation,
    clippy::cast_possible_wrap,
    clippy::string_slice
)]

extern crate alloc;

mod encoding;
mod opcode;
mod program;

pub use encoding::{decode_uvarint, encode_uvarint};
pub use opcode::{InvalidOpcode, Opcode, ARG_MIN};
pub use program::{
    Binding, Constant, FuncCode, Position, Program, ProgramError, CURRENT_VERSION,
};
