/// The external text generator, consumed through the [`Generator`] trait.

pub mod chat;
pub mod credentials;
pub mod error;
pub mod generator;
pub mod mock;

pub use chat::ChatCompletionsGenerator;
pub use credentials::{ConfiguredCredentials, CredentialsResolver};
pub use error::{CredentialsError, GenerationError};
pub use generator::{Credentials, Generator};
