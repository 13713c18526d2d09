//! # sfi
//!
//! A simple file importer: reads a document and replaces every `{{file}}`
//! directive with the contents of `file`, recursively, so imported files may
//! import further files. Output is streamed in document order while scanning.
//!
//! ## Syntax
//!
//! - `{{path/to/file}}` is replaced by the expansion of that file. The name is
//!   taken verbatim and resolved against the working directory (or a
//!   configured base directory).
//! - `\{` and `\}` produce a literal `{` and `}`, so `\{{` never opens a
//!   directive.
//! - An open token without a matching close token is copied through as text.
//!
//! ## Usage
//!
//! ### As a Library
//!
//! ```no_run
//! use sfi::{Expander, Source, TemplateConfig, WriteSink};
//!
//! let expander = Expander::new(TemplateConfig::default());
//! let mut sink = WriteSink::new(std::io::stdout().lock());
//! expander
//!     .expand_source(&Source::Path("page.txt".into()), &mut sink)
//!     .expect("expansion failed");
//! ```
//!
//! ### As a CLI Tool
//!
//! ```bash
//! # Expand a document
//! sfi page.txt
//!
//! # Expand standard input
//! echo 'Header: {{header.txt}}' | sfi
//!
//! # List the directives of a document as JSON
//! sfi page.txt --list=json
//! ```

pub mod error;
pub mod fs_utils;
pub mod template;

// Re-export main types and functions for convenience
pub use error::{Result, SfiError};
pub use fs_utils::{Buffer, Source, copy_chunk, read_source, read_to_buffer};
pub use template::{
    Capture, CapturedChunk, Chunk, Delimiters, Directive, EscapeTable, EscapeTransformer,
    Expander, Segment, Segments, Sink, TemplateConfig, Transformer, WriteSink, expand_to_string,
    find_directives, locate,
};
