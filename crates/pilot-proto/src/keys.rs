use std::fmt;

/// Directory (and object-store prefix) that holds captured screenshots.
pub const SCREENSHOT_DIR: &str = "screenshots";

const EXTENSION: &str = ".jpg";

/// Trims and lowercases a username before it is used in any key.
pub fn normalize_username(raw: &str) -> String {
    raw.trim().to_lowercase()
}

/// Identity of one captured screenshot: `{username}/{epochMillis}.jpg`.
///
/// The same key names the local file (below `screenshots/`), the upload
/// request (through `userId` and `timestamp`), the delete request and the
/// sync listing.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ScreenshotKey {
    username: String,
    captured_at: i64,
}

impl ScreenshotKey {
    pub fn new(username: &str, captured_at: i64) -> Self {
        Self {
            username: normalize_username(username),
            captured_at,
        }
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    pub fn captured_at(&self) -> i64 {
        self.captured_at
    }

    pub fn file_name(&self) -> String {
        format!("{}{EXTENSION}", self.captured_at)
    }

    pub fn object_key(&self) -> String {
        format!("{}/{}", self.username, self.file_name())
    }

    /// Full object-store path, `screenshots/{username}/{epochMillis}.jpg`.
    pub fn object_path(&self) -> String {
        format!("{SCREENSHOT_DIR}/{}", self.object_key())
    }

    /// Parses `user/123.jpg` or `screenshots/user/123.jpg`. Anything before the
    /// last two path segments is ignored, so presigned URL paths work too.
    pub fn parse(path: &str) -> Option<Self> {
        let mut segments = path.trim_matches('/').rsplit('/');
        let file = segments.next()?;
        let user = segments.next()?;
        if user.trim().is_empty() {
            return None;
        }
        Self::from_file_name(user, file)
    }

    pub fn from_file_name(username: &str, file_name: &str) -> Option<Self> {
        let stem = file_name.strip_suffix(EXTENSION)?;
        if stem.is_empty() || !stem.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        let captured_at = stem.parse().ok()?;
        Some(Self::new(username, captured_at))
    }
}

impl fmt::Display for ScreenshotKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}{EXTENSION}", self.username, self.captured_at)
    }
}
