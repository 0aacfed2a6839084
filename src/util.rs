use std::path::Path;

/// Make a string safe to embed in a single filename component.
///
/// Tab names and input-file names feed into staging filenames; separators
/// and control characters would escape the staging directory or produce
/// unopenable paths.
pub fn sanitize_component(raw: &str) -> String {
    raw.chars()
        .map(|ch| match ch {
            '/' | '\\' | ':' => '_',
            ch if ch.is_control() => '_',
            ch => ch,
        })
        .collect()
}

/// Lossy filename (with extension) of a path, for staging keys and logs.
pub fn file_name_string(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().to_string())
        .unwrap_or_else(|| path.display().to_string())
}

/// Lossy file stem of a path, used to derive report and output-dir names.
pub fn file_stem_string(path: &Path) -> String {
    path.file_stem()
        .map(|stem| stem.to_string_lossy().to_string())
        .unwrap_or_else(|| file_name_string(path))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn sanitize_component_replaces_separators() {
        assert_eq!(sanitize_component("Detail_1"), "Detail_1");
        assert_eq!(sanitize_component("a/b\\c:d"), "a_b_c_d");
    }

    #[test]
    fn file_stem_strips_extension() {
        assert_eq!(
            file_stem_string(&PathBuf::from("/tmp/YYZ1 22DEC25.xlsx")),
            "YYZ1 22DEC25"
        );
    }
}
