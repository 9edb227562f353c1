pub mod controller;

pub use controller::Sigil;
