use crate::types::WillMessage;

/// Protocol level byte for MQTT 3.1.
pub const PROTOCOL_LEVEL_V31: u8 = 3;
/// Protocol level byte for MQTT 3.1.1.
pub const PROTOCOL_LEVEL_V311: u8 = 4;
/// Protocol level byte for MQTT 5.0.
pub const PROTOCOL_LEVEL_V5: u8 = 5;

/// MQTT CONNECT packet
#[derive(Debug, Clone)]
pub struct ConnectPacket {
    /// Protocol level from the variable header (3, 4 or 5)
    pub protocol_level: u8,
    /// Clean session flag (Clean Start in v5.0)
    pub clean_session: bool,
    /// Keep alive interval in seconds; 0 disables the idle timer
    pub keep_alive: u16,
    /// Client identifier; may be empty when the broker assigns one
    pub client_id: String,
    /// Username (optional)
    pub username: Option<String>,
    /// Password bytes (optional)
    pub password: Option<Vec<u8>>,
    /// Will message (optional)
    pub will: Option<WillMessage>,
}

impl ConnectPacket {
    /// Creates a v3.1.1 clean-session CONNECT with a 60 second keep alive.
    #[must_use]
    pub fn new(client_id: impl Into<String>) -> Self {
        Self {
            protocol_level: PROTOCOL_LEVEL_V311,
            clean_session: true,
            keep_alive: 60,
            client_id: client_id.into(),
            username: None,
            password: None,
            will: None,
        }
    }

    /// Sets the protocol level.
    #[must_use]
    pub fn with_protocol_level(mut self, level: u8) -> Self {
        self.protocol_level = level;
        self
    }

    /// Sets the clean session flag.
    #[must_use]
    pub fn with_clean_session(mut self, clean: bool) -> Self {
        self.clean_session = clean;
        self
    }

    /// Sets the keep alive interval.
    #[must_use]
    pub fn with_keep_alive(mut self, seconds: u16) -> Self {
        self.keep_alive = seconds;
        self
    }

    /// Sets username and password.
    #[must_use]
    pub fn with_credentials(mut self, username: impl Into<String>, password: &[u8]) -> Self {
        self.username = Some(username.into());
        self.password = Some(password.to_vec());
        self
    }

    /// Sets a username without a password.
    #[must_use]
    pub fn with_username(mut self, username: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self
    }

    /// Sets the will message.
    #[must_use]
    pub fn with_will(mut self, will: WillMessage) -> Self {
        self.will = Some(will);
        self
    }

    /// Returns true if the username flag is set.
    #[must_use]
    pub fn has_username(&self) -> bool {
        self.username.is_some()
    }

    /// Returns true if the password flag is set.
    #[must_use]
    pub fn has_password(&self) -> bool {
        self.password.is_some()
    }
}
