use async_trait::async_trait;
use pgwire::api::auth::{AuthSource, LoginInfo, Password};
use pgwire::error::PgWireResult;

/// Shared-password source for the cleartext handshake. Every login gets the
/// same server-configured password; per-admin identity rides in on the
/// `decided_by` column of a decision, not on the connection.
#[derive(Debug)]
pub struct RoomswapAuthSource {
    password: Vec<u8>,
}

impl RoomswapAuthSource {
    pub fn new(password: String) -> Self {
        Self {
            password: password.into_bytes(),
        }
    }
}

#[async_trait]
impl AuthSource for RoomswapAuthSource {
    async fn get_password(&self, _login: &LoginInfo) -> PgWireResult<Password> {
        Ok(Password::new(None, self.password.clone()))
    }
}
