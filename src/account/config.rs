/// Tunables of an [`Account`](crate::Account).
#[derive(Clone, Debug)]
pub struct AccountConfig {
    /// Maximum number of chain links derived to reach a single envelope.
    pub max_skipped_messages: u32,
    /// Protocol identifier bound to every session backup as associated data.
    pub protocol_info: Vec<u8>,
}

impl Default for AccountConfig {
    fn default() -> Self {
        Self {
            max_skipped_messages: 1000,
            protocol_info: b"Tandem-E2E-v1".to_vec(),
        }
    }
}
