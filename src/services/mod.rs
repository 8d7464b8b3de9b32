pub mod allow_list;
pub mod clipboard;
pub mod file_store;
pub mod opener;

pub(crate) use allow_list::AllowList;
pub(crate) use clipboard::{ClipboardService, LineEnding, SystemClipboard};
pub(crate) use file_store::{file_href, local_file_url, FileStore, StoreError};
pub(crate) use opener::{resolve_open_target, Opener, SystemOpener};
