use std::fmt;

/// Helper struct that wraps a byte slice and improves its [`std::fmt::Debug`]
/// formatting. Renders the bytes as contiguous lowercase hex, the way lock
/// keys and ids appear in log lines and in the text protocol.
///
/// # Examples
///
/// ```
/// # use warden::base::utils::HexBytes;
/// assert_eq!(format!("{:?}", HexBytes(&[0x11, 0x11])), "1111");
/// assert_eq!(format!("{:?}", HexBytes(&[0x00, 0xff])), "00ff");
/// ```
pub struct HexBytes<'a>(pub &'a [u8]);

impl fmt::Debug for HexBytes<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for &b in self.0 {
            write!(f, "{:02x}", b)?;
        }
        Ok(())
    }
}

impl fmt::Display for HexBytes<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}
