pub mod extract;
pub mod model;
pub mod policy;
pub mod signatures;
