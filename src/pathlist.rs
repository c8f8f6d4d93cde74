//! File resolution across directories and zip archives.
//!
//! Model definitions, register maps and snapshots are data files that may live in any of several
//! places: next to the executable, in a models directory, or inside a zip archive of the shipped
//! SMDX pack. A [`PathList`] is an ordered list of such locations; reading a file returns the
//! first hit.
//!
//! A location containing a component whose name ends in `.zip` is treated as an archive: the
//! remaining components select a directory inside it, joined with `/` regardless of platform.

use crate::error::Error;
use std::io::Read;
use std::path::{Path, PathBuf};

/// An ordered list of filesystem and zip locations to search for data files.
#[derive(Debug, Clone, Default)]
pub struct PathList {
    paths: Vec<PathBuf>,
}

impl PathList {
    /// Create an empty path list.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a path list from locations, searched in order.
    pub fn from_paths(paths: impl IntoIterator<Item = impl Into<PathBuf>>) -> Self {
        Self {
            paths: paths.into_iter().map(Into::into).collect(),
        }
    }

    /// Append a location.
    pub fn add(&mut self, path: impl Into<PathBuf>) {
        self.paths.push(path.into());
    }

    /// The configured locations.
    pub fn paths(&self) -> &[PathBuf] {
        &self.paths
    }

    /// Read the first instance of `filename` found in the path list.
    ///
    /// Returns [`Error::NotFound`] when no location holds the file; I/O failures while reading a
    /// location that does exist surface as [`Error::Io`].
    pub fn read(&self, filename: &str) -> Result<Vec<u8>, Error> {
        for path in &self.paths {
            match split_zip(path) {
                Some((zip_path, inner)) => {
                    if !zip_path.exists() {
                        continue;
                    }

                    if let Some(data) = read_zip_entry(&zip_path, &inner, filename)? {
                        return Ok(data);
                    }
                }
                None => {
                    let full = path.join(filename);

                    if full.exists() {
                        return Ok(std::fs::read(full)?);
                    }
                }
            }
        }

        Err(Error::NotFound(filename.to_string()))
    }
}

impl core::fmt::Display for PathList {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let mut first = true;

        for path in &self.paths {
            if !first {
                f.write_str(", ")?;
            }

            write!(f, "{}", path.display())?;
            first = false;
        }

        Ok(())
    }
}

/// Split a location at its first `.zip` component into the archive path and the directory prefix
/// inside the archive.
fn split_zip(path: &Path) -> Option<(PathBuf, String)> {
    let components: Vec<_> = path.components().collect();

    let zip_index = components.iter().position(|c| {
        c.as_os_str()
            .to_string_lossy()
            .to_ascii_lowercase()
            .ends_with(".zip")
    })?;

    let zip_path: PathBuf = components[..=zip_index].iter().collect();

    let inner = components[zip_index + 1..]
        .iter()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect::<Vec<_>>()
        .join("/");

    Some((zip_path, inner))
}

fn read_zip_entry(
    zip_path: &Path,
    inner: &str,
    filename: &str,
) -> Result<Option<Vec<u8>>, Error> {
    let file = std::fs::File::open(zip_path)?;
    let mut archive = zip::ZipArchive::new(file).map_err(zip_error)?;

    let entry_name = if inner.is_empty() {
        filename.to_string()
    } else {
        format!("{}/{}", inner, filename)
    };

    let mut entry = match archive.by_name(&entry_name) {
        Ok(entry) => entry,
        Err(zip::result::ZipError::FileNotFound) => return Ok(None),
        Err(e) => return Err(zip_error(e)),
    };

    let mut data = Vec::with_capacity(entry.size() as usize);

    entry.read_to_end(&mut data)?;

    Ok(Some(data))
}

fn zip_error(e: zip::result::ZipError) -> Error {
    Error::Io(std::io::Error::new(
        std::io::ErrorKind::InvalidData,
        e.to_string(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn scratch_dir(tag: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("sunspec-pathlist-{}-{}", tag, std::process::id()));

        let _ = std::fs::remove_dir_all(&dir);
        std::fs::create_dir_all(&dir).unwrap();

        dir
    }

    #[test]
    fn first_hit_wins() {
        let first = scratch_dir("first");
        let second = scratch_dir("second");

        std::fs::write(first.join("data.txt"), b"from first").unwrap();
        std::fs::write(second.join("data.txt"), b"from second").unwrap();

        let pathlist = PathList::from_paths([&first, &second]);

        assert_eq!(pathlist.read("data.txt").unwrap(), b"from first");
    }

    #[test]
    fn later_location_searched_on_miss() {
        let first = scratch_dir("miss");
        let second = scratch_dir("hit");

        std::fs::write(second.join("only.txt"), b"here").unwrap();

        let pathlist = PathList::from_paths([&first, &second]);

        assert_eq!(pathlist.read("only.txt").unwrap(), b"here");
    }

    #[test]
    fn missing_file_is_name_error() {
        let dir = scratch_dir("empty");
        let pathlist = PathList::from_paths([&dir]);

        assert!(matches!(
            pathlist.read("nope.txt"),
            Err(Error::NotFound(name)) if name == "nope.txt"
        ));
    }

    #[test]
    fn zip_archive_with_directory_prefix() {
        let dir = scratch_dir("zip");
        let zip_path = dir.join("models.zip");

        {
            let file = std::fs::File::create(&zip_path).unwrap();
            let mut writer = zip::ZipWriter::new(file);

            writer
                .start_file("smdx/smdx_00001.xml", zip::write::FileOptions::default())
                .unwrap();
            writer.write_all(b"<sunSpecModels/>").unwrap();
            writer.finish().unwrap();
        }

        let mut pathlist = PathList::new();

        pathlist.add(zip_path.join("smdx"));

        assert_eq!(
            pathlist.read("smdx_00001.xml").unwrap(),
            b"<sunSpecModels/>"
        );

        assert!(matches!(
            pathlist.read("smdx_99999.xml"),
            Err(Error::NotFound(_))
        ));
    }
}
