//! Per-service databases.

mod mariadb;

pub use mariadb::{read_admin_password, MariaDbManager};

use async_trait::async_trait;
use secrecy::SecretString;

use crate::error::ControlResult;
use crate::types::{DatabaseBinding, ServiceName};

/// Credentials of a freshly provisioned database.
///
/// The password is only ever held here and in the service's secrets file.
#[derive(Debug)]
pub struct DatabaseCredentials {
    /// Schema name.
    pub name: String,
    /// Principal name.
    pub user: String,
    /// Generated password.
    pub password: SecretString,
}

impl DatabaseCredentials {
    /// The non-secret part, as stored in the service record.
    #[must_use]
    pub fn binding(&self) -> DatabaseBinding {
        DatabaseBinding {
            name: self.name.clone(),
            user: self.user.clone(),
        }
    }
}

/// Creates and drops isolated schema and principal pairs.
#[async_trait]
pub trait DatabaseManager: Send + Sync {
    /// Create the schema and principal for `name` with a generated password.
    ///
    /// Refuses when the schema already exists. A partial creation is cleaned
    /// up before the error is returned.
    async fn create_database(&self, name: &ServiceName) -> ControlResult<DatabaseCredentials>;

    /// Drop the principal and the schema for `name`. Missing objects are fine.
    async fn drop_database(&self, name: &ServiceName) -> ControlResult<()>;
}
