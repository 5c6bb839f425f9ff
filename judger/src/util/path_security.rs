//! Validation of file paths supplied by submissions before they are written
//! into a sandbox box.

use std::path::{Component, Path};

/// Accept only plain relative paths that stay inside the box directory.
///
/// Unlike a lexical normalization check, any `..` component is rejected
/// outright: a box never needs one and it is the usual way out of it.
pub fn enforce_box_path(path: &str) -> Result<(), String> {
    if path.is_empty() {
        return Err("empty path".into());
    }
    if path.contains('\0') {
        return Err(format!("path {:?} contains a NUL byte", path));
    }
    let mut normal = 0;
    for part in Path::new(path).components() {
        match part {
            Component::Prefix(_) | Component::RootDir => {
                return Err(format!("path {} is absolute", path));
            }
            Component::ParentDir => {
                return Err(format!("path {} refers to a parent directory", path));
            }
            Component::CurDir => {}
            Component::Normal(_) => normal += 1,
        }
    }
    if normal == 0 {
        return Err(format!("path {} names no file", path));
    }
    Ok(())
}
