pub mod observation;
pub mod status;
