pub mod settings;
pub mod simulate;
