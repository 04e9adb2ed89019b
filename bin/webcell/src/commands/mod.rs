pub mod call;
pub mod doctor;
pub mod relay;
