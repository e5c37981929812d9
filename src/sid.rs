use std::borrow::Cow;
use std::fmt;
use std::sync::Arc;

/// A socket identifier, unique across the whole process.
///
/// For a socket on the default namespace it is equal to the underlying
/// connection id. For any other namespace it is `"<namespace>#<conn id>"`,
/// so the same connection can hold one socket per namespace without
/// collisions.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Sid(Arc<str>);

impl Sid {
    pub(crate) fn new(ns: &str, conn_id: &str) -> Self {
        if ns == "/" {
            Self(Arc::from(conn_id))
        } else {
            Self(Arc::from(format!("{}#{}", ns, conn_id).as_str()))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Sid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
impl fmt::Debug for Sid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Sid {
    fn from(value: &str) -> Self {
        Self(Arc::from(value))
    }
}
impl From<String> for Sid {
    fn from(value: String) -> Self {
        Self(Arc::from(value.as_str()))
    }
}
impl From<&Sid> for Cow<'static, str> {
    fn from(value: &Sid) -> Self {
        Cow::Owned(value.0.to_string())
    }
}
