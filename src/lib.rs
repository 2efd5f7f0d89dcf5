pub mod lang;
pub mod x64;
