/// Testing utilities for the consensus workspace
/// 
/// Provides:
/// - Random payload generators
/// - Proptest strategies for rounds and committee sizes
/// - Tracing initialisation for test output

pub mod generators;
pub mod fixtures;

pub use generators::*;
pub use fixtures::*;
