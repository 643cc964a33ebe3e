pub mod account;
pub mod recipient;
