use serde::{Deserialize, Serialize};
use std::fmt;
use std::num::NonZeroU32;

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NetworkInterface {
    pub index: NonZeroU32,
    pub name: String,
}

impl fmt::Display for NetworkInterface {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (index {})", self.name, self.index)
    }
}

// Linux IFNAMSIZ includes the trailing NUL.
pub const MAX_INTERFACE_NAME_LEN: usize = 15;

pub fn is_valid_interface_name(name: &str) -> bool {
    (1..=MAX_INTERFACE_NAME_LEN).contains(&name.len()) && name.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'-')
}
