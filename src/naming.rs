//! Display names for tasks. aria2 often reports no file path until the
//! download has actually started, so the name falls back through the source
//! URL and finally the gid.

use std::path::Path;

use url::Url;

const DISPOSITION_PARAMS: [&str; 3] = ["response-content-disposition", "rcd", "content-disposition"];
const NAME_PARAMS: [&str; 3] = ["filename", "name", "file"];

pub fn derive_filename(gid: &str, daemon_path: Option<&str>, source_url: Option<&str>) -> String {
    daemon_path
        .and_then(filename_from_path)
        .or_else(|| source_url.and_then(filename_from_url))
        .unwrap_or_else(|| synthetic_name(gid))
}

/// Basename of a daemon-reported path, ignoring placeholders like `""` or `"."`.
pub fn filename_from_path(path: &str) -> Option<String> {
    let path = path.trim();
    if path.len() <= 1 {
        return None;
    }
    Path::new(path)
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .filter(|n| !n.is_empty())
}

pub fn filename_from_url(url: &str) -> Option<String> {
    let parsed = Url::parse(url).ok()?;
    let pairs = parsed
        .query_pairs()
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect::<Vec<_>>();
    let param = |name: &str| pairs.iter().find(|(k, _)| k == name).map(|(_, v)| v.as_str());

    for name in DISPOSITION_PARAMS {
        if let Some(found) = param(name).and_then(filename_from_disposition) {
            return Some(found);
        }
    }

    if let Some(last) = parsed
        .path_segments()
        .and_then(|mut segments| segments.next_back())
        .filter(|s| !s.is_empty())
    {
        let decoded = decode(last);
        if !decoded.is_empty() {
            return Some(decoded);
        }
    }

    NAME_PARAMS.into_iter().find_map(|name| {
        param(name)
            .map(str::trim)
            .filter(|v| !v.is_empty() && *v != "download")
            .map(ToString::to_string)
    })
}

/// Pulls the file name out of a `Content-Disposition` style value, preferring the
/// RFC 5987 `filename*=` form.
pub fn filename_from_disposition(value: &str) -> Option<String> {
    if let Some(idx) = value.find("filename*=") {
        let rest = &value[idx + "filename*=".len()..];
        let rest = rest.split(';').next().unwrap_or_default().trim();
        let encoded = rest.split_once("''").map(|(_, v)| v).unwrap_or(rest);
        let name = sanitize(&decode(encoded.trim_matches(|c: char| c == '"' || c == '\'')));
        if name.is_some() {
            return name;
        }
    }

    let idx = value.find("filename=")?;
    let rest = value[idx + "filename=".len()..].trim_start();
    let raw = match rest.strip_prefix('"') {
        Some(quoted) => quoted.split('"').next().unwrap_or_default(),
        None => rest.split(';').next().unwrap_or_default(),
    };
    sanitize(&decode(raw.trim_matches(|c: char| c == '"' || c == '\'' || c == ';' || c.is_whitespace())))
}

pub fn synthetic_name(gid: &str) -> String {
    let prefix = gid.chars().take(8).collect::<String>();
    format!("download_{prefix}")
}

// `+` stays literal as it does in paths and header values.
fn decode(value: &str) -> String {
    String::from_utf8_lossy(&urlencoding::decode_binary(value.as_bytes())).into_owned()
}

// Keeps only the final path component so a header can't smuggle in directories.
fn sanitize(name: &str) -> Option<String> {
    name.rsplit(['/', '\\'])
        .next()
        .map(str::trim)
        .filter(|n| !n.is_empty() && *n != "." && *n != "..")
        .map(ToString::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn url_path_basename_wins_over_plain_query() {
        assert_eq!(
            filename_from_url("http://x/file.zip?x=1").as_deref(),
            Some("file.zip")
        );
    }

    #[test]
    fn disposition_query_parameter_comes_first() {
        let url = r#"http://cdn.example/obj/abc123?response-content-disposition=attachment;filename="report.pdf""#;
        assert_eq!(filename_from_url(url).as_deref(), Some("report.pdf"));

        let encoded = "https://s3.example/b/key?response-content-disposition=attachment%3B%20filename%3D%22Q3%20report.pdf%22";
        assert_eq!(filename_from_url(encoded).as_deref(), Some("Q3 report.pdf"));
    }

    #[test]
    fn rfc5987_disposition_is_decoded() {
        assert_eq!(
            filename_from_disposition("attachment; filename*=UTF-8''na%C3%AFve.txt").as_deref(),
            Some("naïve.txt")
        );
    }

    #[test]
    fn plus_is_not_a_space() {
        assert_eq!(decode("a+b%20c"), "a+b c");
        assert_eq!(decode("%E2%82%AC.txt"), "€.txt");
    }

    #[test]
    fn path_segment_is_percent_decoded() {
        assert_eq!(
            filename_from_url("https://example.com/files/my%20video.mp4").as_deref(),
            Some("my video.mp4")
        );
    }

    #[test]
    fn named_query_parameter_used_when_path_is_bare() {
        assert_eq!(
            filename_from_url("https://example.com/?file=setup%2Eexe").as_deref(),
            Some("setup.exe")
        );
        assert_eq!(filename_from_url("https://example.com/?name=download"), None);
    }

    #[test]
    fn chain_prefers_daemon_path_then_url_then_gid() {
        assert_eq!(
            derive_filename("2089b05ecca3d829", Some("/dl/real.iso"), Some("http://x/other.iso")),
            "real.iso"
        );
        assert_eq!(
            derive_filename("2089b05ecca3d829", Some(""), Some("http://x/other.iso")),
            "other.iso"
        );
        assert_eq!(
            derive_filename("2089b05ecca3d829", Some("."), None),
            "download_2089b05e"
        );
    }
}
