use std::collections::BTreeMap;

use serde::Deserialize;

// Attribute holding the per-attempt execution id, stamped during job setup.
pub const EXEC_UUID_KEY: &str = "exec_uuid";

// Attributes carrying serialized file-description documents.
pub const DOWNLOAD_FILES_KEY: &str = "download_files";
pub const UPLOAD_FILES_KEY: &str = "upload_files";

// One delivery pulled from the job queue. `ack_id` is the claim handle the
// queue hands out per delivery; lease renewal and acknowledgement key on it.
#[derive(Debug, Clone, Deserialize)]
pub struct JobMessage {
    pub id: String,
    pub ack_id: String,
    #[serde(default)]
    pub attributes: BTreeMap<String, String>,
    #[serde(default)]
    pub data: String,
}

impl JobMessage {
    pub fn validate(&self) -> bool {
        !self.id.is_empty() && !self.ack_id.is_empty()
    }

    // Empty attribute values count as absent.
    pub fn attribute(&self, key: &str) -> Option<&str> {
        self.attributes
            .get(key)
            .map(|v| v.as_str())
            .filter(|v| !v.trim().is_empty())
    }

    pub fn insert_attribute(&mut self, key: &str, value: String) {
        self.attributes.insert(key.to_string(), value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message() -> JobMessage {
        JobMessage {
            id: "msg-001".to_string(),
            ack_id: "ack-001".to_string(),
            attributes: BTreeMap::from([
                ("script".to_string(), "sort".to_string()),
                ("blank".to_string(), "  ".to_string()),
            ]),
            data: "payload".to_string(),
        }
    }

    #[test]
    fn validate_requires_id_and_ack_id() {
        assert!(message().validate());

        let mut no_id = message();
        no_id.id.clear();
        assert!(!no_id.validate());

        let mut no_ack = message();
        no_ack.ack_id.clear();
        assert!(!no_ack.validate());
    }

    #[test]
    fn attribute_treats_blank_values_as_absent() {
        let msg = message();
        assert_eq!(msg.attribute("script"), Some("sort"));
        assert_eq!(msg.attribute("blank"), None);
        assert_eq!(msg.attribute("missing"), None);
    }

    #[test]
    fn insert_attribute_overwrites() {
        let mut msg = message();
        msg.insert_attribute(EXEC_UUID_KEY, "abc".to_string());
        assert_eq!(msg.attribute(EXEC_UUID_KEY), Some("abc"));
        msg.insert_attribute(EXEC_UUID_KEY, "def".to_string());
        assert_eq!(msg.attribute(EXEC_UUID_KEY), Some("def"));
    }
}
