//! Back end: x86-64 encoding primitives, code generation, AOT image assembly.

pub mod aot;
pub mod codegen;
pub mod x86;

pub use aot::{assemble, AotImage};
pub use codegen::{codegen, FunctionAsm};
