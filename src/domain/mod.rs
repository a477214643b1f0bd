//! Domain layer - Core price rules and models.
//!
//! Pure types and the validation engine. No I/O here (hexagonal
//! architecture inner ring); everything is testable in isolation.

pub mod price;
pub mod validator;

// Re-export core types for convenience
pub use price::{PriceReading, PriceSource, Quote, derive_price};
pub use validator::{
    LastValidPrice, PriceValidator, Rejection, Validation, ValidationRules,
    ValidatorState,
};
