pub mod linalg;
pub mod mvn;
