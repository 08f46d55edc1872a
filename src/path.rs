//! Path parsing and namespace resolution.
//!
//! Paths are absolute, `/`-delimited byte strings. Resolution walks the
//! directory tree child by child; when only the final component is missing,
//! the direct parent is still reported so that callers can create the
//! missing entry in place.

use core::cmp::Ordering;

use crate::errors::{CanFail, FsError, FsResult};
use crate::fs::FsCore;
use crate::hash::ObjectId;

/// Longest permitted path component, which is also the longest filename an
/// inode record can carry.
pub(crate) const FILENAME_MAX_LEN: usize = 255;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum TokenKind {
    None,
    Branch,
    Leaf,
}

/// Incremental `/`-separated tokenizer.
pub(crate) struct PathParser<'a> {
    path: &'a [u8],
    off: usize,
    pub(crate) token_kind: TokenKind,
    pub(crate) token: &'a [u8],
}

impl<'a> PathParser<'a> {
    pub(crate) fn new(path: &'a [u8]) -> Self {
        Self {
            path,
            off: 0,
            token_kind: TokenKind::None,
            token: b"",
        }
    }

    /// Advances to the next component. The first component must be empty
    /// (paths begin with `/`); the final component is tagged as the leaf.
    pub(crate) fn parse_next(&mut self) -> CanFail<FsError> {
        if self.token_kind == TokenKind::Leaf {
            return Err(FsError::Invalid);
        }

        let rest = &self.path[self.off..];
        let token_len = match rest.iter().position(|&b| b == b'/') {
            Some(pos) => {
                self.token_kind = TokenKind::Branch;
                pos
            }
            None => {
                if self.token_kind == TokenKind::None {
                    // No separator at all: the path does not start with '/'.
                    return Err(FsError::Invalid);
                }
                self.token_kind = TokenKind::Leaf;
                rest.len()
            }
        };

        if token_len > FILENAME_MAX_LEN {
            return Err(FsError::Invalid);
        }

        self.token = &rest[..token_len];
        self.off += token_len + 1;

        Ok(())
    }
}

/// Result of a path lookup.
pub(crate) struct PathLookup<'a> {
    /// The resolved terminal inode, or `None` when the leaf is missing.
    pub(crate) inode: Option<ObjectId>,

    /// Direct parent of the terminal component, when the walk got that far.
    pub(crate) parent: Option<ObjectId>,

    /// The last component parsed.
    pub(crate) leaf: &'a [u8],

    /// Whether the walk consumed the whole path. `false` means an
    /// intermediate directory was missing.
    pub(crate) leaf_reached: bool,
}

impl FsCore {
    /// Finds the child of `parent_id` carrying `name`.
    ///
    /// The child list is sorted, so the scan stops at the first sibling
    /// ordered after the probe.
    pub(crate) fn path_find_child(
        &self,
        parent_id: ObjectId,
        name: &[u8],
    ) -> FsResult<ObjectId> {
        let children = self.hash.inode(parent_id)?.children();

        for &child_id in children {
            match self.inode_filename_cmp(child_id, name)? {
                Ordering::Equal => return Ok(child_id),
                Ordering::Greater => break,
                Ordering::Less => {}
            }
        }

        Err(FsError::NotFound)
    }

    /// Resolves `path` from the root directory.
    ///
    /// Only a missing leaf yields `Ok` with `inode: None`; a missing
    /// intermediate directory is reported the same way with
    /// `leaf_reached: false`. Malformed paths yield `Invalid`.
    pub(crate) fn path_find<'a>(&self, path: &'a [u8]) -> FsResult<PathLookup<'a>> {
        let root = self.root_dir.ok_or(FsError::Uninit)?;
        let mut parser = PathParser::new(path);

        // Leading component: must be the empty root token.
        parser.parse_next()?;
        if !parser.token.is_empty() {
            return Err(FsError::Invalid);
        }
        let mut cur = root;
        loop {
            parser.parse_next()?;

            match parser.token_kind {
                TokenKind::Branch => {
                    // Ignore empty intermediate components ("//").
                    if parser.token.is_empty() {
                        continue;
                    }

                    match self.path_find_child(cur, parser.token) {
                        Ok(next) => cur = next,
                        Err(FsError::NotFound) => {
                            return Ok(PathLookup {
                                inode: None,
                                parent: Some(cur),
                                leaf: parser.token,
                                leaf_reached: false,
                            })
                        }
                        Err(e) => return Err(e),
                    }
                }
                TokenKind::Leaf => {
                    if parser.token.is_empty() {
                        // Trailing slash: the path names `cur` itself.
                        return Ok(PathLookup {
                            inode: Some(cur),
                            parent: self.hash.inode(cur)?.parent,
                            leaf: parser.token,
                            leaf_reached: true,
                        });
                    }

                    return match self.path_find_child(cur, parser.token) {
                        Ok(found) => Ok(PathLookup {
                            inode: Some(found),
                            parent: Some(cur),
                            leaf: parser.token,
                            leaf_reached: true,
                        }),
                        Err(FsError::NotFound) => Ok(PathLookup {
                            inode: None,
                            parent: Some(cur),
                            leaf: parser.token,
                            leaf_reached: true,
                        }),
                        Err(e) => Err(e),
                    };
                }
                TokenKind::None => unreachable!(),
            }
        }
    }

    /// Resolves a path that must already exist.
    pub(crate) fn path_find_existing(&self, path: &[u8]) -> FsResult<ObjectId> {
        self.path_find(path)?.inode.ok_or(FsError::NotFound)
    }

    /// Unlinks the file or directory at `path`; directories take their
    /// entire subtree with them.
    pub(crate) fn path_unlink(&mut self, path: &[u8]) -> CanFail<FsError> {
        let id = self.path_find_existing(path)?;
        self.inode_unlink(id)
    }

    /// Renames and/or moves `from` to `to`.
    ///
    /// An existing object at the destination is clobbered, provided it is of
    /// the same kind as the source.
    pub(crate) fn path_rename(&mut self, from: &[u8], to: &[u8]) -> CanFail<FsError> {
        let from_id = self.path_find_existing(from)?;
        if from_id == ObjectId::ROOT {
            return Err(FsError::Invalid);
        }
        let from_parent = self.hash.inode(from_id)?.parent;

        let to_lookup = self.path_find(to)?;
        let to_parent = to_lookup.parent;
        let leaf = to_lookup.leaf;

        match to_lookup.inode {
            Some(to_id) => {
                if to_id == from_id {
                    return Ok(());
                }
                if from_id.is_dir() != to_id.is_dir() {
                    // Cannot clobber one kind of object with the other.
                    return Err(FsError::Invalid);
                }

                self.inode_unlink(to_id)?;
            }
            None => {
                if !to_lookup.leaf_reached {
                    // Intermediate directory doesn't exist.
                    return Err(FsError::Invalid);
                }
            }
        }

        if from_parent != to_parent {
            self.inode_remove_child(from_id)?;
        }

        let mut name = alloc::vec::Vec::with_capacity(leaf.len());
        name.extend_from_slice(leaf);
        self.inode_rename(from_id, to_parent, &name)?;

        if from_parent != to_parent {
            if let Some(new_parent) = to_parent {
                self.inode_add_child(new_parent, from_id)?;
            }
        } else if let Some(parent_id) = from_parent {
            // Same directory, new name: the sibling list must be re-sorted
            // around the renamed entry.
            self.inode_remove_child(from_id)?;
            self.inode_add_child(parent_id, from_id)?;
        }

        Ok(())
    }

    /// Creates the directory at `path`; all intermediate directories must
    /// already exist.
    pub(crate) fn path_new_dir(&mut self, path: &[u8]) -> FsResult<ObjectId> {
        let lookup = self.path_find(path)?;

        if lookup.inode.is_some() {
            return Err(FsError::Exists);
        }
        if !lookup.leaf_reached {
            return Err(FsError::NotFound);
        }
        let parent = lookup.parent.ok_or(FsError::NotFound)?;
        if lookup.leaf.is_empty() {
            return Err(FsError::Invalid);
        }

        let leaf = lookup.leaf;
        let mut name = alloc::vec::Vec::with_capacity(leaf.len());
        name.extend_from_slice(leaf);

        self.file_new(Some(parent), &name, true)
    }
}

#[cfg(test)]
mod tests {
    use super::{PathParser, TokenKind};
    use crate::errors::FsError;
    use crate::fs::Access;
    use crate::testutil::{new_formatted_fs, read_back, write_new_file};

    #[test]
    fn parser_walks_components_and_tags_the_leaf() {
        let mut parser = PathParser::new(b"/usr/share/doc");

        parser.parse_next().unwrap();
        assert_eq!(parser.token, b"");
        assert_eq!(parser.token_kind, TokenKind::Branch);

        parser.parse_next().unwrap();
        assert_eq!(parser.token, b"usr");
        assert_eq!(parser.token_kind, TokenKind::Branch);

        parser.parse_next().unwrap();
        assert_eq!(parser.token, b"share");

        parser.parse_next().unwrap();
        assert_eq!(parser.token, b"doc");
        assert_eq!(parser.token_kind, TokenKind::Leaf);

        assert_eq!(parser.parse_next(), Err(FsError::Invalid));
    }

    #[test]
    fn relative_paths_are_invalid() {
        let mut parser = PathParser::new(b"usr");
        assert_eq!(parser.parse_next(), Err(FsError::Invalid));

        let fs = new_formatted_fs();
        assert_eq!(fs.mkdir("no-slash"), Err(FsError::Invalid));
    }

    #[test]
    fn lookup_reports_parent_when_leaf_is_missing() {
        let fs = new_formatted_fs();
        fs.mkdir("/etc").unwrap();

        let core = fs.core();
        let lookup = core.path_find(b"/etc/fstab").unwrap();
        assert!(lookup.inode.is_none());
        assert!(lookup.leaf_reached);
        assert_eq!(lookup.leaf, b"fstab");

        let etc = core.path_find_existing(b"/etc").unwrap();
        assert_eq!(lookup.parent, Some(etc));
    }

    #[test]
    fn missing_intermediate_is_not_leaf_reached() {
        let fs = new_formatted_fs();

        let core = fs.core();
        let lookup = core.path_find(b"/no/such/dir").unwrap();
        assert!(lookup.inode.is_none());
        assert!(!lookup.leaf_reached);
    }

    #[test]
    fn empty_intermediate_components_are_ignored() {
        let fs = new_formatted_fs();
        fs.mkdir("/a").unwrap();
        write_new_file(&fs, "/a/f.txt", &[b"slashes."]);

        assert_eq!(read_back(&fs, "/a//f.txt"), b"slashes.");
    }

    #[test]
    fn mkdir_twice_reports_exists() {
        let fs = new_formatted_fs();
        fs.mkdir("/once").unwrap();
        assert_eq!(fs.mkdir("/once"), Err(FsError::Exists));
    }

    #[test]
    fn rename_moves_between_directories() {
        let fs = new_formatted_fs();
        fs.mkdir("/src").unwrap();
        fs.mkdir("/dst").unwrap();
        write_new_file(&fs, "/src/f.bin", &[b"move me!"]);

        fs.rename("/src/f.bin", "/dst/g.bin").unwrap();

        assert_eq!(fs.open("/src/f.bin", Access::READ).unwrap_err(), FsError::NotFound);
        assert_eq!(read_back(&fs, "/dst/g.bin"), b"move me!");
    }

    #[test]
    fn rename_round_trip_preserves_content() {
        let fs = new_formatted_fs();
        write_new_file(&fs, "/a", &[b"original"]);

        fs.rename("/a", "/b").unwrap();
        fs.rename("/b", "/a").unwrap();

        assert_eq!(read_back(&fs, "/a"), b"original");
    }

    #[test]
    fn rename_clobbers_same_kind_only() {
        let fs = new_formatted_fs();
        write_new_file(&fs, "/f1", &[b"f1f1f1f1"]);
        write_new_file(&fs, "/f2", &[b"f2f2f2f2"]);
        fs.mkdir("/d").unwrap();

        fs.rename("/f1", "/f2").unwrap();
        assert_eq!(read_back(&fs, "/f2"), b"f1f1f1f1");

        assert_eq!(fs.rename("/f2", "/d"), Err(FsError::Invalid));
    }
}
