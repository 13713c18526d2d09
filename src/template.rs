use crate::error::{Result, SfiError};
use crate::fs_utils::{Source, copy_chunk, read_source, resolve_import};
use serde::Serialize;
use std::io::Write;
use std::ops::Range;
use std::path::PathBuf;
use tracing::{debug, trace};

/// Byte that hides a pattern occurrence directly following it
pub const ESCAPE_BYTE: u8 = b'\\';

/// Open/close tokens surrounding an import directive
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delimiters {
    open: Vec<u8>,
    close: Vec<u8>,
}

impl Delimiters {
    /// # Errors
    ///
    /// Returns `SfiError::EmptyDelimiter` if either token is empty.
    pub fn new(open: impl Into<Vec<u8>>, close: impl Into<Vec<u8>>) -> Result<Self> {
        let (open, close) = (open.into(), close.into());
        if open.is_empty() {
            return Err(SfiError::EmptyDelimiter { which: "open" });
        }
        if close.is_empty() {
            return Err(SfiError::EmptyDelimiter { which: "close" });
        }
        Ok(Self { open, close })
    }

    pub fn open(&self) -> &[u8] {
        &self.open
    }

    pub fn close(&self) -> &[u8] {
        &self.close
    }
}

impl Default for Delimiters {
    fn default() -> Self {
        Self {
            open: b"{{".to_vec(),
            close: b"}}".to_vec(),
        }
    }
}

/// Ordered escape sequences and the literal text each one decodes to.
///
/// Entry order decides which sequence wins when two match at the same offset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EscapeTable {
    entries: Vec<(Vec<u8>, Vec<u8>)>,
}

impl EscapeTable {
    /// # Errors
    ///
    /// Returns `SfiError::EmptyEscape` if any sequence is empty.
    pub fn new<S, R>(entries: impl IntoIterator<Item = (S, R)>) -> Result<Self>
    where
        S: Into<Vec<u8>>,
        R: Into<Vec<u8>>,
    {
        let entries: Vec<(Vec<u8>, Vec<u8>)> = entries
            .into_iter()
            .map(|(sequence, replacement)| (sequence.into(), replacement.into()))
            .collect();
        if let Some(index) = entries.iter().position(|(sequence, _)| sequence.is_empty()) {
            return Err(SfiError::EmptyEscape { index });
        }
        Ok(Self { entries })
    }
}

impl Default for EscapeTable {
    fn default() -> Self {
        Self {
            entries: vec![
                (b"\\{".to_vec(), b"{".to_vec()),
                (b"\\}".to_vec(), b"}".to_vec()),
            ],
        }
    }
}

/// Configuration for template expansion
#[derive(Debug, Clone, Default)]
pub struct TemplateConfig {
    /// Tokens marking an import directive
    pub delimiters: Delimiters,
    /// Escape sequences decoded inside literal text
    pub escapes: EscapeTable,
    /// Directory relative import names are resolved against (working directory when unset)
    pub base_dir: Option<PathBuf>,
    /// Deepest import nesting allowed; unbounded when unset
    pub max_depth: Option<usize>,
}

/// Finds the first occurrence of `pattern` in `haystack` not directly preceded
/// by a backslash.
///
/// Only one byte of lookback is examined, so in `\\{{` the second backslash
/// still hides the token. A match at offset 0 is never considered escaped.
pub fn locate(haystack: &[u8], pattern: &[u8]) -> Option<usize> {
    if pattern.is_empty() || pattern.len() > haystack.len() {
        return None;
    }
    haystack
        .windows(pattern.len())
        .enumerate()
        .find(|&(pos, window)| {
            window == pattern && (pos == 0 || haystack[pos - 1] != ESCAPE_BYTE)
        })
        .map(|(pos, _)| pos)
}

/// A piece of expanded output
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Chunk<'a> {
    /// Bytes copied unchanged from a source buffer
    Literal(&'a [u8]),
    /// Bytes produced by a transformer
    Decoded(&'a [u8]),
}

impl<'a> Chunk<'a> {
    pub fn as_bytes(&self) -> &'a [u8] {
        match *self {
            Self::Literal(bytes) | Self::Decoded(bytes) => bytes,
        }
    }
}

/// Receives expanded output in traversal order
pub trait Sink {
    /// # Errors
    ///
    /// Returns an error if the chunk cannot be stored or written.
    fn emit(&mut self, chunk: Chunk<'_>) -> Result<()>;
}

/// Sink writing every chunk straight to a byte stream
#[derive(Debug)]
pub struct WriteSink<W: Write> {
    writer: W,
}

impl<W: Write> WriteSink<W> {
    pub fn new(writer: W) -> Self {
        Self { writer }
    }

    /// # Errors
    ///
    /// Returns `SfiError::Io` if flushing the underlying writer fails.
    pub fn flush(&mut self) -> Result<()> {
        self.writer.flush().map_err(Into::into)
    }

    pub fn into_inner(self) -> W {
        self.writer
    }
}

impl<W: Write> Sink for WriteSink<W> {
    fn emit(&mut self, chunk: Chunk<'_>) -> Result<()> {
        self.writer.write_all(chunk.as_bytes())?;
        Ok(())
    }
}

/// A chunk kept by [`Capture`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CapturedChunk {
    Literal(Vec<u8>),
    Decoded(Vec<u8>),
}

/// Sink recording every chunk in memory
#[derive(Debug, Clone, Default)]
pub struct Capture {
    pub chunks: Vec<CapturedChunk>,
}

impl Capture {
    pub fn new() -> Self {
        Self::default()
    }

    /// Concatenation of everything emitted so far
    pub fn bytes(&self) -> Vec<u8> {
        self.chunks
            .iter()
            .flat_map(|chunk| match chunk {
                CapturedChunk::Literal(bytes) | CapturedChunk::Decoded(bytes) => bytes.iter(),
            })
            .copied()
            .collect()
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.bytes()).into_owned()
    }
}

impl Sink for Capture {
    fn emit(&mut self, chunk: Chunk<'_>) -> Result<()> {
        self.chunks.push(match chunk {
            Chunk::Literal(bytes) => CapturedChunk::Literal(bytes.to_vec()),
            Chunk::Decoded(bytes) => CapturedChunk::Decoded(bytes.to_vec()),
        });
        Ok(())
    }
}

/// Rewrites matches inside literal text.
///
/// Offsets are relative to the segment slice handed in.
pub trait Transformer {
    /// Offset of the nearest match, without emitting anything
    fn probe(&self, segment: &[u8]) -> Option<usize>;

    /// Emits the decoded form of the nearest match and returns the offset just
    /// past it, or `None` if nothing matches.
    ///
    /// # Errors
    ///
    /// Returns any error raised by the sink.
    fn apply(&self, segment: &[u8], sink: &mut dyn Sink) -> Result<Option<usize>>;
}

/// Transformer decoding the entries of an [`EscapeTable`]
#[derive(Debug, Clone, Default)]
pub struct EscapeTransformer {
    table: EscapeTable,
}

impl EscapeTransformer {
    pub fn new(table: EscapeTable) -> Self {
        Self { table }
    }

    /// Nearest entry as `(offset, entry index)`, earlier entries winning ties
    fn nearest(&self, segment: &[u8]) -> Option<(usize, usize)> {
        let mut best: Option<(usize, usize)> = None;
        for (index, (sequence, _)) in self.table.entries.iter().enumerate() {
            if let Some(pos) = locate(segment, sequence)
                && best.is_none_or(|(best_pos, _)| pos < best_pos)
            {
                best = Some((pos, index));
            }
        }
        best
    }
}

impl Transformer for EscapeTransformer {
    fn probe(&self, segment: &[u8]) -> Option<usize> {
        self.nearest(segment).map(|(pos, _)| pos)
    }

    fn apply(&self, segment: &[u8], sink: &mut dyn Sink) -> Result<Option<usize>> {
        let Some((pos, index)) = self.nearest(segment) else {
            return Ok(None);
        };
        let (sequence, replacement) = &self.table.entries[index];
        if !replacement.is_empty() {
            sink.emit(Chunk::Decoded(replacement))?;
        }
        Ok(Some(pos + sequence.len()))
    }
}

/// One region of a buffer produced by the scanner
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Segment {
    /// Text emitted after escape decoding
    Literal(Range<usize>),
    /// An import directive
    Directive {
        /// The file name between the tokens
        name: Range<usize>,
        /// The whole directive, tokens included
        span: Range<usize>,
    },
}

#[derive(Debug, Clone, Copy)]
enum ScanState {
    Literal,
    Directive { open_at: usize },
    Done,
}

/// Iterator splitting a buffer into alternating literal and directive segments.
///
/// Empty literal segments are skipped. An open token without a matching close
/// token turns the rest of the buffer, open token included, into one last
/// literal segment.
#[derive(Debug, Clone)]
pub struct Segments<'a> {
    buffer: &'a [u8],
    delimiters: &'a Delimiters,
    cursor: usize,
    state: ScanState,
}

impl<'a> Segments<'a> {
    pub fn new(buffer: &'a [u8], delimiters: &'a Delimiters) -> Self {
        Self {
            buffer,
            delimiters,
            cursor: 0,
            state: ScanState::Literal,
        }
    }
}

impl Iterator for Segments<'_> {
    type Item = Segment;

    fn next(&mut self) -> Option<Segment> {
        let len = self.buffer.len();
        loop {
            match self.state {
                ScanState::Done => return None,
                ScanState::Literal => {
                    let start = self.cursor;
                    if start >= len {
                        self.state = ScanState::Done;
                        return None;
                    }
                    let open = self.delimiters.open();
                    match locate(&self.buffer[start..], open) {
                        Some(offset) => {
                            let open_at = start + offset;
                            self.cursor = open_at + open.len();
                            self.state = ScanState::Directive { open_at };
                            if open_at > start {
                                return Some(Segment::Literal(start..open_at));
                            }
                        }
                        None => {
                            self.cursor = len;
                            self.state = ScanState::Done;
                            return Some(Segment::Literal(start..len));
                        }
                    }
                }
                ScanState::Directive { open_at } => {
                    let start = self.cursor;
                    let close = self.delimiters.close();
                    match locate(&self.buffer[start..], close) {
                        Some(offset) => {
                            let close_at = start + offset;
                            self.cursor = close_at + close.len();
                            self.state = ScanState::Literal;
                            return Some(Segment::Directive {
                                name: start..close_at,
                                span: open_at..self.cursor,
                            });
                        }
                        None => {
                            self.cursor = len;
                            self.state = ScanState::Done;
                            return Some(Segment::Literal(open_at..len));
                        }
                    }
                }
            }
        }
    }
}

/// A directive found in a document, as reported by [`find_directives`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Directive {
    /// File name between the tokens
    pub name: String,
    /// Offset of the open token
    pub start: usize,
    /// Offset just past the close token
    pub end: usize,
    /// Offset of the first file name byte
    pub name_start: usize,
    /// Offset just past the file name
    pub name_end: usize,
}

/// Lists the directives of a single buffer without importing anything
pub fn find_directives(buffer: &[u8], delimiters: &Delimiters) -> Vec<Directive> {
    Segments::new(buffer, delimiters)
        .filter_map(|segment| match segment {
            Segment::Directive { name, span } => Some(Directive {
                name: String::from_utf8_lossy(&buffer[name.clone()]).into_owned(),
                start: span.start,
                end: span.end,
                name_start: name.start,
                name_end: name.end,
            }),
            Segment::Literal(_) => None,
        })
        .collect()
}

/// Recursive import expander.
///
/// Literal text is run through the registered transformers, leftmost match
/// first, and directives are replaced in place by the expansion of the file
/// they name. Output goes to the sink as it is produced; nothing is retracted
/// when a later import fails.
pub struct Expander {
    config: TemplateConfig,
    transformers: Vec<Box<dyn Transformer>>,
}

impl Expander {
    /// Creates an expander decoding the escape table of `config`
    pub fn new(config: TemplateConfig) -> Self {
        let escapes = EscapeTransformer::new(config.escapes.clone());
        Self {
            config,
            transformers: vec![Box::new(escapes)],
        }
    }

    /// Registers another transformer after the existing ones
    #[must_use]
    pub fn with_transformer(mut self, transformer: Box<dyn Transformer>) -> Self {
        self.transformers.push(transformer);
        self
    }

    /// Reads `source` and expands it into `sink`
    ///
    /// # Errors
    ///
    /// Returns the first open, read, write or depth error met anywhere in the
    /// import tree.
    pub fn expand_source(&self, source: &Source, sink: &mut dyn Sink) -> Result<()> {
        let buffer = read_source(source)?;
        debug!(%source, bytes = buffer.len(), "expanding document");
        self.expand_at(buffer.as_bytes(), sink, 0)
    }

    /// Expands an in-memory document into `sink`
    ///
    /// # Errors
    ///
    /// Returns the first open, read, write or depth error met anywhere in the
    /// import tree.
    pub fn expand(&self, buffer: &[u8], sink: &mut dyn Sink) -> Result<()> {
        self.expand_at(buffer, sink, 0)
    }

    fn expand_at(&self, buffer: &[u8], sink: &mut dyn Sink, depth: usize) -> Result<()> {
        for segment in Segments::new(buffer, &self.config.delimiters) {
            match segment {
                Segment::Literal(range) => self.process_literal(&buffer[range], sink)?,
                Segment::Directive { name, .. } => {
                    let name = copy_chunk(buffer, name.start, name.end);
                    let source = resolve_import(name, self.config.base_dir.as_deref());
                    self.import(&source, sink, depth + 1)?;
                }
            }
        }
        Ok(())
    }

    fn import(&self, source: &Source, sink: &mut dyn Sink, depth: usize) -> Result<()> {
        if let Some(max_depth) = self.config.max_depth
            && depth > max_depth
        {
            let path = match source {
                Source::Path(path) => path.clone(),
                Source::Stdin => PathBuf::from("-"),
            };
            return Err(SfiError::DepthExceeded { path, max_depth });
        }

        let imported = read_source(source)?;
        debug!(%source, depth, bytes = imported.len(), "importing");
        self.expand_at(imported.as_bytes(), sink, depth)
    }

    fn process_literal(&self, segment: &[u8], sink: &mut dyn Sink) -> Result<()> {
        trace!(bytes = segment.len(), "literal segment");
        let mut cursor = 0;
        while cursor < segment.len() {
            let rest = &segment[cursor..];
            let mut nearest: Option<(usize, &dyn Transformer)> = None;
            for transformer in &self.transformers {
                if let Some(pos) = transformer.probe(rest)
                    && nearest.is_none_or(|(best, _)| pos < best)
                {
                    nearest = Some((pos, &**transformer));
                }
            }

            let Some((pos, transformer)) = nearest else {
                break;
            };
            if pos > 0 {
                sink.emit(Chunk::Literal(&rest[..pos]))?;
            }
            match transformer.apply(rest, sink)? {
                Some(next) if next > 0 => cursor += next,
                _ => {
                    // matched without advancing: copy the remainder through unchanged
                    sink.emit(Chunk::Literal(&rest[pos..]))?;
                    return Ok(());
                }
            }
        }

        if cursor < segment.len() {
            sink.emit(Chunk::Literal(&segment[cursor..]))?;
        }
        Ok(())
    }
}

/// Expands `buffer` and collects the output as (lossy UTF-8) text
///
/// # Errors
///
/// Returns the first open, read or depth error met anywhere in the import tree.
pub fn expand_to_string(buffer: &[u8], config: &TemplateConfig) -> Result<String> {
    let mut capture = Capture::new();
    Expander::new(config.clone()).expand(buffer, &mut capture)?;
    Ok(capture.text())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn create_test_env() -> (TempDir, TemplateConfig) {
        let temp_dir = TempDir::new().unwrap();
        let config = TemplateConfig {
            base_dir: Some(temp_dir.path().to_path_buf()),
            ..TemplateConfig::default()
        };
        (temp_dir, config)
    }

    fn expand(input: &str, config: &TemplateConfig) -> String {
        expand_to_string(input.as_bytes(), config).unwrap()
    }

    /// Matches a fixed pattern and emits a fixed replacement
    struct Replace {
        pattern: &'static [u8],
        replacement: &'static [u8],
    }

    impl Transformer for Replace {
        fn probe(&self, segment: &[u8]) -> Option<usize> {
            locate(segment, self.pattern)
        }

        fn apply(&self, segment: &[u8], sink: &mut dyn Sink) -> Result<Option<usize>> {
            let Some(pos) = locate(segment, self.pattern) else {
                return Ok(None);
            };
            sink.emit(Chunk::Decoded(self.replacement))?;
            Ok(Some(pos + self.pattern.len()))
        }
    }

    #[test]
    fn test_locate_basic() {
        assert_eq!(locate(b"abc{{def", b"{{"), Some(3));
        assert_eq!(locate(b"{{def", b"{{"), Some(0));
        assert_eq!(locate(b"abcdef", b"{{"), None);
        assert_eq!(locate(b"", b"{{"), None);
        assert_eq!(locate(b"{", b"{{"), None);
        assert_eq!(locate(b"abc", b""), None);
    }

    #[test]
    fn test_locate_escaped() {
        // first occurrence escaped, the overlapping one is not
        assert_eq!(locate(b"a\\{{{b", b"{{"), Some(3));
        assert_eq!(locate(b"a\\{{b", b"{{"), None);
        assert_eq!(locate(b"\\{{ x {{y", b"{{"), Some(6));
    }

    #[test]
    fn test_locate_single_byte_lookback() {
        // a doubled backslash still hides the match
        assert_eq!(locate(b"\\\\{{x", b"{{"), None);
        assert_eq!(locate(b"\\\\{", b"\\{"), None);
        // lookback is never applied at the start of the searched slice
        assert_eq!(locate(&b"\\{{"[1..], b"{{"), Some(0));
    }

    #[test]
    fn test_escape_transformer_probe_nearest() {
        let transformer = EscapeTransformer::default();
        assert_eq!(transformer.probe(b"ab\\}cd\\{"), Some(2));
        assert_eq!(transformer.probe(b"ab\\{cd\\}"), Some(2));
        assert_eq!(transformer.probe(b"plain"), None);
    }

    #[test]
    fn test_escape_transformer_apply() {
        let transformer = EscapeTransformer::default();
        let mut capture = Capture::new();
        let next = transformer.apply(b"ab\\}cd", &mut capture).unwrap();
        assert_eq!(next, Some(4));
        assert_eq!(capture.chunks, vec![CapturedChunk::Decoded(b"}".to_vec())]);

        let mut capture = Capture::new();
        assert_eq!(transformer.apply(b"none", &mut capture).unwrap(), None);
        assert!(capture.chunks.is_empty());
    }

    #[test]
    fn test_escape_table_tie_break() {
        // both sequences match at 0; the earlier entry wins
        let table = EscapeTable::new([("\\{", "first"), ("\\{{", "second")]).unwrap();
        let transformer = EscapeTransformer::new(table);
        let mut capture = Capture::new();
        let next = transformer.apply(b"\\{{", &mut capture).unwrap();
        assert_eq!(next, Some(2));
        assert_eq!(capture.text(), "first");
    }

    #[test]
    fn test_invalid_config() {
        assert!(matches!(
            Delimiters::new("", "}}"),
            Err(SfiError::EmptyDelimiter { which: "open" })
        ));
        assert!(matches!(
            Delimiters::new("{{", ""),
            Err(SfiError::EmptyDelimiter { which: "close" })
        ));
        assert!(matches!(
            EscapeTable::new([("\\{", "{"), ("", "x")]),
            Err(SfiError::EmptyEscape { index: 1 })
        ));
    }

    #[test]
    fn test_segments() {
        let delimiters = Delimiters::default();
        let segments: Vec<_> = Segments::new(b"A{{f}}B", &delimiters).collect();
        assert_eq!(
            segments,
            vec![
                Segment::Literal(0..1),
                Segment::Directive {
                    name: 3..4,
                    span: 1..6
                },
                Segment::Literal(6..7),
            ]
        );

        let segments: Vec<_> = Segments::new(b"{{f}}", &delimiters).collect();
        assert_eq!(
            segments,
            vec![Segment::Directive {
                name: 2..3,
                span: 0..5
            }]
        );

        assert_eq!(Segments::new(b"", &delimiters).count(), 0);
    }

    #[test]
    fn test_segments_unterminated() {
        let delimiters = Delimiters::default();
        let segments: Vec<_> = Segments::new(b"A{{no-close", &delimiters).collect();
        assert_eq!(segments, vec![Segment::Literal(0..1), Segment::Literal(1..11)]);

        let segments: Vec<_> = Segments::new(b"A{{", &delimiters).collect();
        assert_eq!(segments, vec![Segment::Literal(0..1), Segment::Literal(1..3)]);
    }

    #[test]
    fn test_find_directives() {
        let delimiters = Delimiters::default();
        let found = find_directives(b"x {{a.txt}} y {{b.txt}}", &delimiters);
        assert_eq!(found.len(), 2);
        assert_eq!(found[0].name, "a.txt");
        assert_eq!((found[0].start, found[0].end), (2, 11));
        assert_eq!((found[0].name_start, found[0].name_end), (4, 9));
        assert_eq!(found[1].name, "b.txt");

        assert!(find_directives(b"\\{{a.txt}}", &delimiters).is_empty());
        assert!(find_directives(b"{{open", &delimiters).is_empty());
    }

    #[test]
    fn test_identity() {
        let config = TemplateConfig::default();
        let input = "No directives here.\nJust { single } braces and a \\ backslash.\n";
        assert_eq!(expand(input, &config), input);
        assert_eq!(expand("", &config), "");
    }

    #[test]
    fn test_escape_decoding() {
        let config = TemplateConfig::default();
        assert_eq!(expand("\\{", &config), "{");
        assert_eq!(expand("\\}", &config), "}");
        assert_eq!(expand("a\\{\\{b\\}\\}c", &config), "a{{b}}c");
        assert_eq!(expand("\\{{not.txt}}", &config), "{{not.txt}}");
        // doubled backslash hides the escape itself
        assert_eq!(expand("\\\\{x", &config), "\\\\{x");
    }

    #[test]
    fn test_simple_import() {
        let (temp_dir, config) = create_test_env();
        fs::write(temp_dir.path().join("F"), "C").unwrap();

        assert_eq!(expand("A{{F}}B", &config), "ACB");
        assert_eq!(expand("{{F}}{{F}}", &config), "CC");
    }

    #[test]
    fn test_import_chunks_in_order() {
        let (temp_dir, config) = create_test_env();
        fs::write(temp_dir.path().join("part.txt"), "x\\}y").unwrap();

        let mut capture = Capture::new();
        Expander::new(config)
            .expand(b"<{{part.txt}}>", &mut capture)
            .unwrap();
        assert_eq!(
            capture.chunks,
            vec![
                CapturedChunk::Literal(b"<".to_vec()),
                CapturedChunk::Literal(b"x".to_vec()),
                CapturedChunk::Decoded(b"}".to_vec()),
                CapturedChunk::Literal(b"y".to_vec()),
                CapturedChunk::Literal(b">".to_vec()),
            ]
        );
    }

    #[test]
    fn test_nested_import_ordering() {
        let (temp_dir, config) = create_test_env();
        fs::write(temp_dir.path().join("a.txt"), "a1 {{b.txt}} a2").unwrap();
        fs::write(temp_dir.path().join("b.txt"), "b1 {{c.txt}} b2").unwrap();
        fs::write(temp_dir.path().join("c.txt"), "c").unwrap();

        assert_eq!(
            expand("start {{a.txt}} end", &config),
            "start a1 b1 c b2 a2 end"
        );
    }

    #[test]
    fn test_imported_escapes_not_reinterpreted() {
        let (temp_dir, config) = create_test_env();
        // decoded braces in the import do not form a directive in the importer
        fs::write(temp_dir.path().join("inner.txt"), "\\{\\{x\\}\\}").unwrap();
        assert_eq!(expand("{{inner.txt}}", &config), "{{x}}");
    }

    #[test]
    fn test_unterminated_directive() {
        let config = TemplateConfig::default();
        assert_eq!(expand("A{{no-close", &config), "A{{no-close");
        assert_eq!(expand("A{{a\\}b", &config), "A{{a}b");
    }

    #[test]
    fn test_missing_import_keeps_prefix() {
        let (temp_dir, config) = create_test_env();
        fs::write(temp_dir.path().join("ok.txt"), "ok").unwrap();

        let mut capture = Capture::new();
        let result = Expander::new(config).expand(
            b"before {{ok.txt}} mid {{missing.txt}} after",
            &mut capture,
        );
        match result {
            Err(SfiError::Open { path, .. }) => {
                assert_eq!(path, temp_dir.path().join("missing.txt"));
            }
            other => panic!("expected open error, got {other:?}"),
        }
        assert_eq!(capture.text(), "before ok mid ");
    }

    #[test]
    fn test_directive_name_is_verbatim() {
        let (temp_dir, config) = create_test_env();
        fs::write(temp_dir.path().join("name.txt"), "found").unwrap();

        let result = expand_to_string(b"{{ name.txt }}", &config);
        assert!(matches!(result, Err(SfiError::Open { .. })));
        assert_eq!(expand("{{name.txt}}", &config), "found");
    }

    #[test]
    fn test_custom_delimiters_and_escapes() {
        let (temp_dir, mut config) = create_test_env();
        fs::write(temp_dir.path().join("f.txt"), "body").unwrap();
        config.delimiters = Delimiters::new("<%", "%>").unwrap();
        config.escapes = EscapeTable::new([("\\<", "<"), ("\\%", "%")]).unwrap();

        assert_eq!(expand("[<%f.txt%>]", &config), "[body]");
        assert_eq!(expand("{{f.txt}}", &config), "{{f.txt}}");
        assert_eq!(expand("\\<%f.txt%>", &config), "<%f.txt%>");
    }

    #[test]
    fn test_transformer_leftmost_wins() {
        let config = TemplateConfig::default();
        let expander = Expander::new(config).with_transformer(Box::new(Replace {
            pattern: b"@",
            replacement: b"(at)",
        }));
        let mut capture = Capture::new();
        expander.expand(b"a@b\\{c@", &mut capture).unwrap();
        assert_eq!(capture.text(), "a(at)b{c(at)");
    }

    #[test]
    fn test_transformer_tie_first_registered_wins() {
        let config = TemplateConfig::default();
        // matches at the same offset as the `\{` escape, registered later
        let expander = Expander::new(config).with_transformer(Box::new(Replace {
            pattern: b"\\{x",
            replacement: b"LATE",
        }));
        let mut capture = Capture::new();
        expander.expand(b"\\{x", &mut capture).unwrap();
        assert_eq!(capture.text(), "{x");
    }

    #[test]
    fn test_max_depth_guard() {
        let (temp_dir, mut config) = create_test_env();
        fs::write(temp_dir.path().join("self.txt"), "again {{self.txt}}").unwrap();
        config.max_depth = Some(3);

        let mut capture = Capture::new();
        let result = Expander::new(config).expand(b"{{self.txt}}", &mut capture);
        assert!(matches!(
            result,
            Err(SfiError::DepthExceeded { max_depth: 3, .. })
        ));
        assert_eq!(capture.text(), "again again again ");
    }

    #[test]
    fn test_determinism() {
        let (temp_dir, config) = create_test_env();
        fs::write(temp_dir.path().join("a.txt"), "A{{b.txt}}").unwrap();
        fs::write(temp_dir.path().join("b.txt"), "B\\}").unwrap();

        let first = expand("x{{a.txt}}y{{b.txt}}", &config);
        let second = expand("x{{a.txt}}y{{b.txt}}", &config);
        assert_eq!(first, "xAB}yB}");
        assert_eq!(first, second);
    }

    #[test]
    fn test_expand_source_and_write_sink() {
        let (temp_dir, config) = create_test_env();
        let doc = temp_dir.path().join("doc.txt");
        fs::write(temp_dir.path().join("inc.txt"), "inc").unwrap();
        fs::write(&doc, "doc {{inc.txt}}\n").unwrap();

        let mut sink = WriteSink::new(Vec::new());
        Expander::new(config)
            .expand_source(&Source::Path(doc), &mut sink)
            .unwrap();
        assert_eq!(sink.into_inner(), b"doc inc\n");
    }

    #[test]
    fn test_binary_content_passes_through() {
        let (temp_dir, config) = create_test_env();
        let bytes = [0u8, 159, 146, 150, b'\n', 0];
        fs::write(temp_dir.path().join("bin"), bytes).unwrap();

        let mut capture = Capture::new();
        Expander::new(config)
            .expand(b"[{{bin}}]", &mut capture)
            .unwrap();
        let mut expected = vec![b'['];
        expected.extend_from_slice(&bytes);
        expected.push(b']');
        assert_eq!(capture.bytes(), expected);
    }
}
