// Copyright 2025 Kevin Ludwig
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    #[error("Not implemented")]
    Unimplemented,
    #[error("Input/output error")]
    Io,
    #[error("No such file or directory")]
    NotFound,
    #[error("Bad file handle")]
    BadHandle,
    #[error("Too many open files")]
    TooManyOpenFiles,
    #[error("No space left on device")]
    NoSpace,
    #[error("Read-only file system")]
    ReadOnlyFs,
    #[error("Permission denied")]
    AccessDenied,
    #[error("Operation not permitted")]
    NotPermitted,
    #[error("File exists")]
    Exists,
    #[error("Not a directory")]
    NotADirectory,
    #[error("Is a directory")]
    IsDirectory,
    #[error("Directory not empty")]
    NotEmpty,
    #[error("File name too long")]
    NameTooLong,
    #[error("Invalid argument")]
    InvalidArgument,
    #[error("Inconsistent file system")]
    Inconsistent,
}

impl Error {
    /// Linux errno value, for callers that keep a C-style error slot.
    pub fn errno(self) -> i32 {
        match self {
            Error::Unimplemented => 38,
            Error::Io => 5,
            Error::NotFound => 2,
            Error::BadHandle => 9,
            Error::TooManyOpenFiles => 23,
            Error::NoSpace => 28,
            Error::ReadOnlyFs => 30,
            Error::AccessDenied => 13,
            Error::NotPermitted => 1,
            Error::Exists => 17,
            Error::NotADirectory => 20,
            Error::IsDirectory => 21,
            Error::NotEmpty => 39,
            Error::NameTooLong => 36,
            Error::InvalidArgument => 22,
            Error::Inconsistent => 22,
        }
    }
}

pub type Result<T> = core::result::Result<T, Error>;
