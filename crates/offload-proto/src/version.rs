use semver::Version;

/// Product token used in the `server` response header.
pub const PRODUCT: &str = "offload";

/// Formats the `server: <product>/<semver>` header a node advertises.
pub fn server_header(version: &Version) -> String {
    format!("{PRODUCT}/{version}")
}

/// Parses a `server` header into its product token and version.
///
/// Returns `None` for foreign products or unparseable versions; callers
/// treat that as "unknown", never as an error.
pub fn parse_server_header(value: &str) -> Option<(String, Version)> {
    let (product, raw) = value.trim().split_once('/')?;
    let version = Version::parse(raw.trim()).ok()?;
    Some((product.to_string(), version))
}

/// Client and node interoperate when they agree on the major version.
/// A mismatch is worth a warning but never fatal.
pub fn versions_compatible(ours: &Version, theirs: &Version) -> bool {
    ours.major == theirs.major
}
