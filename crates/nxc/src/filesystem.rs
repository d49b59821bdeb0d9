use crate::storage::ReadableStorage;
use std::fmt::{Debug, Display};

#[derive(Debug)]
pub enum Entry<F: ReadableFile, D: ReadableDirectory> {
    File(F),
    Directory(D),
}

impl<F: ReadableFile, D: ReadableDirectory> Entry<F, D> {
    pub fn file(self) -> Option<F> {
        match self {
            Entry::File(f) => Some(f),
            _ => None,
        }
    }

    pub fn directory(self) -> Option<D> {
        match self {
            Entry::Directory(d) => Some(d),
            _ => None,
        }
    }
}

pub trait ReadableFile: Sized {
    type Storage: ReadableStorage;
    type Error: Debug + Display;

    fn name(&self) -> &str;
    fn size(&self) -> u64;
    fn storage(&self) -> Result<Self::Storage, Self::Error>;
}

pub trait ReadableDirectory: Sized {
    type File: ReadableFile;
    type Iter: Iterator<Item = Entry<Self::File, Self>>;

    fn name(&self) -> &str;
    fn entries(&self) -> Self::Iter;
}

pub trait ReadableFileSystem: Sized {
    type File<'a>: ReadableFile + 'a
    where
        Self: 'a;
    type Directory<'a>: ReadableDirectory<File = Self::File<'a>>
    where
        Self: 'a;

    fn root(&self) -> Self::Directory<'_>;
    fn open_file(&self, path: &str) -> Option<Self::File<'_>>;
    fn open_directory(&self, path: &str) -> Option<Self::Directory<'_>>;
}

/// Depth-first walk yielding `/`-separated paths relative to the starting
/// directory (no leading slash).
pub struct RecursiveDirectoryIter<D: ReadableDirectory> {
    stack: Vec<D::Iter>,
    dir_names: Vec<String>,
}

impl<D: ReadableDirectory> RecursiveDirectoryIter<D> {
    fn path_to(&self, name: &str) -> String {
        let mut path = String::new();
        for dir in &self.dir_names {
            path.push_str(dir);
            path.push('/');
        }
        path.push_str(name);
        path
    }
}

impl<D: ReadableDirectory> Iterator for RecursiveDirectoryIter<D> {
    type Item = (String, Entry<D::File, D>);

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let it = self.stack.last_mut()?;
            match it.next() {
                None => {
                    self.stack.pop();
                    self.dir_names.pop();
                }
                Some(Entry::File(f)) => {
                    break Some((self.path_to(f.name()), Entry::File(f)));
                }
                Some(Entry::Directory(d)) => {
                    let path = self.path_to(d.name());
                    self.stack.push(d.entries());
                    self.dir_names.push(d.name().to_string());
                    break Some((path, Entry::Directory(d)));
                }
            }
        }
    }
}

pub trait ReadableDirectoryExt: ReadableDirectory {
    fn entries_recursive(&self) -> RecursiveDirectoryIter<Self> {
        RecursiveDirectoryIter {
            stack: vec![self.entries()],
            dir_names: Vec::new(),
        }
    }
}

impl<T: ReadableDirectory> ReadableDirectoryExt for T {}
