pub mod password;
pub mod validation;

pub use password::{dummy_verify, hash_password, verify_password, Password, PasswordHashString};
pub use validation::ValidatedJson;
