//! Live-process backend built on the Win32 and native APIs.

mod modules;
mod process;
mod threads;

pub use modules::enumerate_modules;
pub use process::WinProcess;
pub use threads::list_threads;
