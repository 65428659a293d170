//! Sea-ORM entities for the records the drift consumer can republish.

pub mod patient;
pub mod patient_medication;
