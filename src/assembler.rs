// Assembler core pipeline and listing/output generation.

use std::fs::{self, File};
use std::io::{self, Write};
use std::path::PathBuf;

use clap::{ArgAction, Parser, ValueEnum};

use crate::error::{
    build_context_lines, AsmError, AsmErrorKind, AsmRunError, AsmRunReport, Diagnostic, LineStatus,
    PassCounts, Severity,
};
use crate::expression::{self, OperandValue};
use crate::imagestore::{ImageStore, SbinHeader};
use crate::instructions::{self, ArgBinding, I_TYPE};
use crate::scanner::{classify, SourceLineKind};
use crate::symbol_table::{RedefinePolicy, SymbolTable, SymbolTableResult};

const VERSION: &str = "1.0";
const LONG_ABOUT: &str = "MIPS-subset assembler producing SBIN executable images.

The SBIN binary (16-byte header followed by the program image) is always
written; use -o/--outfile or -b/--bin to control its name. A listing file
pairing source lines with emitted bytes is opt-in via -l/--list. The
entry label defaults to \"main\" and its address becomes the initial
program counter in the header.";

#[derive(Parser, Debug)]
#[command(
    name = "sbasm",
    version = VERSION,
    about = "MIPS-subset assembler producing SBIN executable images",
    long_about = LONG_ABOUT
)]
pub struct Cli {
    #[arg(
        short = 'i',
        long = "infile",
        value_name = "FILE",
        action = ArgAction::Append,
        long_help = "Input assembly file (repeatable). Must end with .s or .asm."
    )]
    pub infiles: Vec<PathBuf>,
    #[arg(
        short = 'o',
        long = "outfile",
        value_name = "BASE",
        long_help = "Output filename base. Defaults to the input base. With multiple inputs, BASE must be a directory."
    )]
    pub outfile: Option<String>,
    #[arg(
        short = 'b',
        long = "bin",
        value_name = "FILE",
        num_args = 0..=1,
        default_missing_value = "",
        long_help = "Binary output filename. FILE is optional; when omitted, the output base is used and a .bin extension is added."
    )]
    pub bin_name: Option<String>,
    #[arg(
        short = 'l',
        long = "list",
        value_name = "FILE",
        num_args = 0..=1,
        default_missing_value = "",
        long_help = "Emit a listing file. FILE is optional; when omitted, the output base is used and a .lst extension is added."
    )]
    pub list_name: Option<String>,
    #[arg(
        short = 'e',
        long = "entry",
        value_name = "LABEL",
        default_value = "main",
        long_help = "Entry-point label. Its resolved address is written to the header's program counter field."
    )]
    pub entry: String,
    #[arg(
        short = 's',
        long = "stack",
        value_name = "BYTES",
        default_value_t = 1024,
        long_help = "Stack size in bytes reserved above the program image."
    )]
    pub stack_size: u32,
    #[arg(
        short = 'H',
        long = "heap",
        value_name = "BYTES",
        default_value_t = 0,
        long_help = "Heap size in bytes reserved above the stack."
    )]
    pub heap_size: u32,
    #[arg(
        long = "no-directive-warnings",
        action = ArgAction::SetTrue,
        long_help = "Suppress warnings for unknown assembler directives."
    )]
    pub no_directive_warnings: bool,
    #[arg(
        long = "allow-label-redefinition",
        action = ArgAction::SetTrue,
        long_help = "Let a later label definition overwrite an earlier one instead of reporting an error."
    )]
    pub allow_label_redefinition: bool,
    #[arg(
        long = "format",
        value_enum,
        default_value = "human",
        long_help = "Diagnostics output format."
    )]
    pub format: OutputFormat,
    #[arg(
        short = 'q',
        long = "quiet",
        action = ArgAction::SetTrue,
        long_help = "Suppress diagnostic output on success."
    )]
    pub quiet: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    Human,
    Json,
}

/// Assembly options recognized by this core.
#[derive(Debug, Clone)]
pub struct AsmConfig {
    pub warn_unknown_directive: bool,
    pub stack_size: u32,
    pub heap_size: u32,
    pub entry_label: String,
    pub redefine_policy: RedefinePolicy,
}

impl Default for AsmConfig {
    fn default() -> Self {
        Self {
            warn_unknown_directive: true,
            stack_size: 1024,
            heap_size: 0,
            entry_label: "main".to_string(),
            redefine_policy: RedefinePolicy::Reject,
        }
    }
}

impl AsmConfig {
    pub fn from_cli(cli: &Cli) -> Self {
        Self {
            warn_unknown_directive: !cli.no_directive_warnings,
            stack_size: cli.stack_size,
            heap_size: cli.heap_size,
            entry_label: cli.entry.clone(),
            redefine_policy: if cli.allow_label_redefinition {
                RedefinePolicy::Overwrite
            } else {
                RedefinePolicy::Reject
            },
        }
    }
}

/// Run the assembler with command-line arguments.
pub fn run() -> Result<Vec<AsmRunReport>, AsmRunError> {
    let cli = Cli::parse();
    run_with_cli(&cli)
}

pub fn run_with_cli(cli: &Cli) -> Result<Vec<AsmRunReport>, AsmRunError> {
    if cli.infiles.is_empty() {
        return Err(AsmRunError::new(
            AsmError::new(
                AsmErrorKind::Cli,
                "No input files specified. Use -i/--infile",
                None,
            ),
            Vec::new(),
            Vec::new(),
        ));
    }

    if cli.infiles.len() > 1 {
        for (name, flag) in [(&cli.list_name, "-l/--list"), (&cli.bin_name, "-b/--bin")] {
            if let Some(name) = name.as_deref() {
                if !name.is_empty() {
                    return Err(AsmRunError::new(
                        AsmError::new(
                            AsmErrorKind::Cli,
                            &format!("Explicit {flag} filenames are not allowed with multiple inputs"),
                            None,
                        ),
                        Vec::new(),
                        Vec::new(),
                    ));
                }
            }
        }
    }

    let out_dir = if cli.infiles.len() > 1 {
        if let Some(out) = cli.outfile.as_deref() {
            let out_path = PathBuf::from(out);
            if out_path.exists() && !out_path.is_dir() {
                return Err(AsmRunError::new(
                    AsmError::new(
                        AsmErrorKind::Cli,
                        "-o/--outfile must be a directory when multiple inputs are provided",
                        None,
                    ),
                    Vec::new(),
                    Vec::new(),
                ));
            }
            if let Err(err) = fs::create_dir_all(&out_path) {
                return Err(AsmRunError::new(
                    AsmError::new(AsmErrorKind::Io, &err.to_string(), Some(out)),
                    Vec::new(),
                    Vec::new(),
                ));
            }
            Some(out_path)
        } else {
            None
        }
    } else {
        None
    };

    let config = AsmConfig::from_cli(cli);
    let mut reports = Vec::new();
    for asm_path in &cli.infiles {
        let (asm_name, input_base) = input_base_from_path(asm_path)?;
        let out_base = if let Some(dir) = &out_dir {
            dir.join(&input_base).to_string_lossy().to_string()
        } else {
            cli.outfile.as_deref().unwrap_or(&input_base).to_string()
        };
        let report = run_one(cli, &asm_name, &out_base, &config)?;
        reports.push(report);
    }

    Ok(reports)
}

fn run_one(
    cli: &Cli,
    asm_name: &str,
    out_base: &str,
    config: &AsmConfig,
) -> Result<AsmRunReport, AsmRunError> {
    let mut assembler = Assembler::with_config(config.clone());
    if let Err(err) = assembler.load_source_file(asm_name) {
        return Err(AsmRunError::new(err, Vec::new(), Vec::new()));
    }
    let source_lines = assembler.source_lines().to_vec();

    let list_path = resolve_output_path(out_base, cli.list_name.clone(), "lst");
    let mut list_output: Box<dyn Write> = if let Some(path) = &list_path {
        Box::new(File::create(path).map_err(|_| {
            AsmRunError::new(
                AsmError::new(AsmErrorKind::Io, "Error opening file for write", Some(path)),
                Vec::new(),
                Vec::new(),
            )
        })?)
    } else {
        Box::new(io::sink())
    };
    let mut listing = ListingWriter::new(&mut *list_output);
    if let Err(err) = listing.header() {
        return Err(AsmRunError::new(
            AsmError::new(AsmErrorKind::Io, &err.to_string(), None),
            assembler.take_diagnostics(),
            source_lines.clone(),
        ));
    }

    let (pass1, pass2) = match assembler.assemble(&mut listing) {
        Ok(counts) => counts,
        Err(err) => {
            return Err(AsmRunError::new(
                err,
                assembler.take_diagnostics(),
                source_lines.clone(),
            ))
        }
    };
    let totals = PassCounts {
        lines: pass2.lines,
        errors: pass1.errors + pass2.errors,
        warnings: pass1.warnings + pass2.warnings,
    };
    if let Err(err) = listing.footer(&totals, assembler.symbols(), assembler.image().len()) {
        return Err(AsmRunError::new(
            AsmError::new(AsmErrorKind::Io, &err.to_string(), None),
            assembler.take_diagnostics(),
            source_lines.clone(),
        ));
    }

    let diagnostics = assembler.take_diagnostics();

    if totals.errors > 0 {
        return Err(AsmRunError::new(
            AsmError::new(
                AsmErrorKind::Assembler,
                "Errors detected in source. No binary file created.",
                None,
            ),
            diagnostics,
            source_lines,
        ));
    }

    let entry_addr = match assembler.entry_address() {
        Some(addr) => addr,
        None => {
            return Err(AsmRunError::new(
                AsmError::new(
                    AsmErrorKind::Symbol,
                    "Entry label not found",
                    Some(&config.entry_label),
                ),
                diagnostics,
                source_lines,
            ))
        }
    };

    let bin_path = match resolve_output_path(
        out_base,
        Some(cli.bin_name.clone().unwrap_or_default()),
        "bin",
    ) {
        Some(path) => path,
        None => format!("{out_base}.bin"),
    };
    let header = SbinHeader::for_image(
        assembler.image().position(),
        entry_addr,
        config.stack_size,
        config.heap_size,
    );
    let mut bin_file = File::create(&bin_path).map_err(|_| {
        AsmRunError::new(
            AsmError::new(
                AsmErrorKind::Io,
                "Error opening file for write",
                Some(&bin_path),
            ),
            Vec::new(),
            source_lines.clone(),
        )
    })?;
    if let Err(err) = assembler.image().write_sbin_file(&mut bin_file, &header) {
        return Err(AsmRunError::new(
            AsmError::new(AsmErrorKind::Io, &err.to_string(), None),
            Vec::new(),
            source_lines,
        ));
    }

    Ok(AsmRunReport::new(diagnostics, source_lines))
}

fn input_base_from_path(path: &PathBuf) -> Result<(String, String), AsmRunError> {
    let asm_name = path.to_string_lossy().to_string();
    let file_name = match path.file_name().and_then(|s| s.to_str()) {
        Some(name) => name,
        None => {
            return Err(AsmRunError::new(
                AsmError::new(AsmErrorKind::Cli, "Invalid input file name", None),
                Vec::new(),
                Vec::new(),
            ))
        }
    };
    let base = if let Some(base) = file_name.strip_suffix(".s") {
        base
    } else if let Some(base) = file_name.strip_suffix(".asm") {
        base
    } else {
        return Err(AsmRunError::new(
            AsmError::new(AsmErrorKind::Cli, "Input file must end with .s or .asm", None),
            Vec::new(),
            Vec::new(),
        ));
    };
    Ok((asm_name, base.to_string()))
}

fn resolve_output_path(base: &str, name: Option<String>, extension: &str) -> Option<String> {
    let name = name?;
    if name.is_empty() {
        return Some(format!("{base}.{extension}"));
    }
    let mut path = PathBuf::from(&name);
    if path.extension().is_none() {
        path = PathBuf::from(format!("{name}.{extension}"));
    }
    Some(path.to_string_lossy().to_string())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AsmState {
    Unloaded,
    Loaded,
    Finalized,
}

/// One-shot two-pass assembler over a single source program.
pub struct Assembler {
    config: AsmConfig,
    state: AsmState,
    source_lines: Vec<String>,
    symbols: SymbolTable,
    image: ImageStore,
    diagnostics: Vec<Diagnostic>,
}

impl Assembler {
    pub fn new() -> Self {
        Self::with_config(AsmConfig::default())
    }

    pub fn with_config(config: AsmConfig) -> Self {
        Self {
            config,
            state: AsmState::Unloaded,
            source_lines: Vec::new(),
            symbols: SymbolTable::new(),
            image: ImageStore::new(),
            diagnostics: Vec::new(),
        }
    }

    pub fn load_source_file(&mut self, path: &str) -> Result<(), AsmError> {
        let contents = fs::read_to_string(path)
            .map_err(|err| AsmError::new(AsmErrorKind::Io, &err.to_string(), Some(path)))?;
        self.load_source_str(&contents)
    }

    /// Load source text, normalizing Windows line endings. A given
    /// instance accepts source exactly once.
    pub fn load_source_str(&mut self, text: &str) -> Result<(), AsmError> {
        if self.state != AsmState::Unloaded {
            return Err(AsmError::new(
                AsmErrorKind::Usage,
                "Assembly source already loaded",
                None,
            ));
        }
        let text = text.replace("\r\n", "\n");
        self.source_lines = text.split('\n').map(str::to_string).collect();
        self.state = AsmState::Loaded;
        Ok(())
    }

    pub fn source_lines(&self) -> &[String] {
        &self.source_lines
    }

    pub fn symbols(&self) -> &SymbolTable {
        &self.symbols
    }

    pub fn image(&self) -> &ImageStore {
        &self.image
    }

    pub fn diagnostics(&self) -> &[Diagnostic] {
        &self.diagnostics
    }

    /// Drain collected diagnostics, sorted by source line for reporting.
    pub fn take_diagnostics(&mut self) -> Vec<Diagnostic> {
        let mut diagnostics = std::mem::take(&mut self.diagnostics);
        diagnostics.sort_by_key(Diagnostic::line);
        diagnostics
    }

    pub fn entry_address(&self) -> Option<u32> {
        self.symbols.lookup(&self.config.entry_label)
    }

    /// Run both passes over the loaded source.
    ///
    /// Assembling before loading, or a second time, is a fatal usage
    /// error. Recoverable problems in the source are collected as
    /// diagnostics and never abort a pass.
    pub fn assemble<W: Write>(
        &mut self,
        listing: &mut ListingWriter<W>,
    ) -> Result<(PassCounts, PassCounts), AsmError> {
        match self.state {
            AsmState::Unloaded => {
                return Err(AsmError::new(
                    AsmErrorKind::Usage,
                    "No assembly source loaded",
                    None,
                ))
            }
            AsmState::Finalized => {
                return Err(AsmError::new(
                    AsmErrorKind::Usage,
                    "Assembly source can only be processed once per assembler instance",
                    None,
                ))
            }
            AsmState::Loaded => {}
        }

        let first = first_pass(&self.source_lines, &self.config);
        self.symbols = first.symbols;
        self.diagnostics.extend(first.diagnostics);

        let second = second_pass(&self.source_lines, &self.symbols, &self.config, listing)
            .map_err(|err| AsmError::new(AsmErrorKind::Io, &err.to_string(), None))?;
        self.image = second.image;
        self.diagnostics.extend(second.diagnostics);
        let mut pass2_counts = second.counts;

        // Labels bound in pass 1 are only valid if pass 2 lays out the
        // image identically.
        if first.image_len != self.image.position() {
            let err = AsmError::new(
                AsmErrorKind::Assembler,
                "Pass 1 and pass 2 image lengths differ; label addresses are unreliable",
                None,
            );
            self.diagnostics
                .push(Diagnostic::new(pass2_counts.lines, Severity::Error, err));
            pass2_counts.errors += 1;
        }

        self.state = AsmState::Finalized;
        Ok((first.counts, pass2_counts))
    }
}

impl Default for Assembler {
    fn default() -> Self {
        Self::new()
    }
}

struct FirstPassOutput {
    symbols: SymbolTable,
    diagnostics: Vec<Diagnostic>,
    image_len: u32,
    counts: PassCounts,
}

/// Pass 1: discover label addresses. Byte lengths are computed with
/// placeholder label values so they do not depend on addresses not yet
/// known.
fn first_pass(lines: &[String], config: &AsmConfig) -> FirstPassOutput {
    let mut symbols = SymbolTable::with_policy(config.redefine_policy);
    let mut image = ImageStore::new();
    image.write_io_window();

    let mut diagnostics = Vec::new();
    let mut counts = PassCounts::new();
    let mut line_num: u32 = 1;

    let mut asm_line = AsmLine::new(PassSymbols::Collecting(&mut symbols), config);
    for src in lines {
        let status = asm_line.process(src, image.position());
        image.append_slice(asm_line.bytes());
        for err in asm_line.errors() {
            diagnostics.push(Diagnostic::new(line_num, Severity::Error, err.clone()));
        }
        for warn in asm_line.warnings() {
            diagnostics.push(Diagnostic::new(line_num, Severity::Warning, warn.clone()));
        }
        match status {
            LineStatus::Error => counts.errors += 1,
            LineStatus::Warning => counts.warnings += 1,
            _ => {}
        }
        // Every physical line advances the counter exactly once,
        // whatever the line produced.
        line_num += 1;
    }
    drop(asm_line);

    counts.lines = line_num - 1;
    FirstPassOutput {
        symbols,
        diagnostics,
        image_len: image.position(),
        counts,
    }
}

struct SecondPassOutput {
    image: ImageStore,
    diagnostics: Vec<Diagnostic>,
    counts: PassCounts,
}

/// Pass 2: re-emit the byte stream against the frozen symbol table.
fn second_pass<W: Write>(
    lines: &[String],
    symbols: &SymbolTable,
    config: &AsmConfig,
    listing: &mut ListingWriter<W>,
) -> io::Result<SecondPassOutput> {
    let mut image = ImageStore::new();
    image.write_io_window();

    let mut diagnostics = Vec::new();
    let mut counts = PassCounts::new();
    let mut line_num: u32 = 1;

    let mut asm_line = AsmLine::new(PassSymbols::Frozen(symbols), config);
    for src in lines {
        let addr = image.position();
        let status = asm_line.process(src, addr);
        image.append_slice(asm_line.bytes());

        listing.write_line(ListingLine {
            addr,
            bytes: asm_line.bytes(),
            line_num,
            source: src,
        })?;

        for err in asm_line.errors() {
            diagnostics.push(Diagnostic::new(line_num, Severity::Error, err.clone()));
            listing.write_diagnostic("ERROR", err.message(), line_num, lines)?;
        }
        for warn in asm_line.warnings() {
            diagnostics.push(Diagnostic::new(line_num, Severity::Warning, warn.clone()));
            listing.write_diagnostic("WARNING", warn.message(), line_num, lines)?;
        }
        match status {
            LineStatus::Error => counts.errors += 1,
            LineStatus::Warning => counts.warnings += 1,
            _ => {}
        }
        line_num += 1;
    }

    counts.lines = line_num - 1;
    Ok(SecondPassOutput {
        image,
        diagnostics,
        counts,
    })
}

pub struct ListingLine<'a> {
    pub addr: u32,
    pub bytes: &'a [u8],
    pub line_num: u32,
    pub source: &'a str,
}

pub struct ListingWriter<W: Write> {
    out: W,
}

impl<W: Write> ListingWriter<W> {
    pub fn new(out: W) -> Self {
        Self { out }
    }

    pub fn header(&mut self) -> io::Result<()> {
        writeln!(self.out, "sbasm MIPS assembler v{VERSION}")?;
        writeln!(self.out, "ADDR      BYTES        LINE  SOURCE")?;
        writeln!(self.out, "--------  -----------  ----  ------")?;
        Ok(())
    }

    pub fn write_line(&mut self, line: ListingLine<'_>) -> io::Result<()> {
        let (loc, bytes_col) = if line.bytes.is_empty() {
            ("----".to_string(), String::new())
        } else {
            (format!("{:08X}", line.addr), format_bytes(line.bytes))
        };
        writeln!(
            self.out,
            "{:<8}  {:<11}  {:>4}  {}",
            loc, bytes_col, line.line_num, line.source
        )?;
        if !line.bytes.is_empty() {
            writeln!(self.out, "{:<25}{}", "", format_binary(line.bytes))?;
        }
        Ok(())
    }

    pub fn write_diagnostic(
        &mut self,
        kind: &str,
        msg: &str,
        line_num: u32,
        source_lines: &[String],
    ) -> io::Result<()> {
        let context = build_context_lines(line_num, None, Some(source_lines), None, true);
        for line in context {
            writeln!(self.out, "{line}")?;
        }
        writeln!(self.out, "{kind}: {msg}")
    }

    pub fn footer(
        &mut self,
        counts: &PassCounts,
        symbols: &SymbolTable,
        total_mem: usize,
    ) -> io::Result<()> {
        writeln!(
            self.out,
            "\nLines: {}  Errors: {}  Warnings: {}",
            counts.lines, counts.errors, counts.warnings
        )?;
        writeln!(self.out, "\nSYMBOL TABLE\n")?;
        symbols.dump(&mut self.out)?;
        writeln!(self.out, "\nTotal memory is {} bytes", total_mem)?;
        Ok(())
    }
}

fn format_bytes(bytes: &[u8]) -> String {
    bytes
        .iter()
        .map(|b| format!("{:02X}", b))
        .collect::<Vec<_>>()
        .join(" ")
}

fn format_binary(bytes: &[u8]) -> String {
    bytes
        .iter()
        .map(|b| format!("{:08b}", b))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Label sink for the running pass: pass 1 collects definitions, pass 2
/// reads a frozen table.
enum PassSymbols<'a> {
    Collecting(&'a mut SymbolTable),
    Frozen(&'a SymbolTable),
}

/// Per-line assembler state.
struct AsmLine<'a> {
    symbols: PassSymbols<'a>,
    config: &'a AsmConfig,
    bytes: Vec<u8>,
    start_addr: u32,
    errors: Vec<AsmError>,
    warnings: Vec<AsmError>,
}

impl<'a> AsmLine<'a> {
    fn new(symbols: PassSymbols<'a>, config: &'a AsmConfig) -> Self {
        Self {
            symbols,
            config,
            bytes: Vec::with_capacity(8),
            start_addr: 0,
            errors: Vec::new(),
            warnings: Vec::new(),
        }
    }

    fn is_first_pass(&self) -> bool {
        matches!(self.symbols, PassSymbols::Collecting(_))
    }

    fn symbols_for_eval(&self) -> Option<&SymbolTable> {
        match &self.symbols {
            PassSymbols::Collecting(_) => None,
            PassSymbols::Frozen(table) => Some(table),
        }
    }

    fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    fn errors(&self) -> &[AsmError] {
        &self.errors
    }

    fn warnings(&self) -> &[AsmError] {
        &self.warnings
    }

    /// Process one source line at the given byte position. Always returns
    /// a status; the caller advances the line counter unconditionally.
    fn process(&mut self, line: &str, addr: u32) -> LineStatus {
        self.errors.clear();
        self.warnings.clear();
        self.bytes.clear();
        self.start_addr = addr;

        let kind = classify(line);
        let base = match &kind {
            SourceLineKind::Blank => LineStatus::NothingDone,
            _ => LineStatus::Ok,
        };
        match kind {
            SourceLineKind::Blank => {}
            SourceLineKind::Label(name) => self.process_label(&name),
            SourceLineKind::Directive { name, args } => self.process_directive(&name, &args),
            SourceLineKind::Instruction { mnemonic, args } => {
                self.process_instruction(&mnemonic, &args)
            }
        }

        if !self.errors.is_empty() {
            LineStatus::Error
        } else if !self.warnings.is_empty() {
            LineStatus::Warning
        } else {
            base
        }
    }

    /// Record an error for this line. Pass 1 stays silent for problems
    /// that recur identically in pass 2, so each is reported once.
    fn note_error(&mut self, kind: AsmErrorKind, msg: &str, param: Option<&str>) {
        if self.is_first_pass() {
            return;
        }
        self.errors.push(AsmError::new(kind, msg, param));
    }

    fn note_eval_error(&mut self, err: AsmError) {
        if self.is_first_pass() {
            return;
        }
        self.errors.push(err);
    }

    /// Evaluate an operand, degrading to the zero default on error so the
    /// line still encodes deterministically.
    fn eval_operand(&mut self, expr: &str) -> OperandValue {
        match expression::evaluate(expr, self.symbols_for_eval()) {
            Ok(value) => value,
            Err(err) => {
                self.note_eval_error(err);
                OperandValue::default()
            }
        }
    }

    /// Evaluate an operand that must not carry a base+offset form.
    fn eval_plain(&mut self, expr: &str) -> i64 {
        let operand = self.eval_operand(expr);
        if operand.offset.is_some() {
            self.note_error(
                AsmErrorKind::Expression,
                "Unexpected base+offset operand",
                Some(expr),
            );
        }
        operand.value
    }

    fn process_label(&mut self, name: &str) {
        if !self.is_first_pass() {
            // Labels persist from pass 1; the table is frozen now.
            return;
        }
        if !is_valid_label(name) {
            self.errors.push(AsmError::new(
                AsmErrorKind::Symbol,
                "Illegal character in label. Must be alphanum or underscore",
                Some(name),
            ));
            return;
        }
        let result = match &mut self.symbols {
            PassSymbols::Collecting(symbols) => symbols.add(name, self.start_addr),
            PassSymbols::Frozen(_) => return,
        };
        if result == SymbolTableResult::Duplicate {
            self.errors.push(AsmError::new(
                AsmErrorKind::Symbol,
                "Label defined more than once",
                Some(name),
            ));
        }
    }

    fn process_directive(&mut self, name: &str, args: &[String]) {
        if name.eq_ignore_ascii_case("word") {
            if args.len() != 1 {
                self.note_error(
                    AsmErrorKind::Directive,
                    "Directive .word expects exactly one operand",
                    None,
                );
                return;
            }
            let value = self.eval_plain(&args[0]);
            // Data words use the image's little-endian order, unlike the
            // big-endian instruction words.
            self.bytes.extend_from_slice(&(value as u32).to_le_bytes());
        } else if self.is_first_pass() && self.config.warn_unknown_directive {
            // Warned during pass 1 only so two passes do not repeat it.
            self.warnings.push(AsmError::new(
                AsmErrorKind::Directive,
                "Unknown assembler directive",
                Some(name),
            ));
        }
    }

    fn process_instruction(&mut self, mnemonic: &str, args: &[String]) {
        if mnemonic.eq_ignore_ascii_case("nop") {
            // Fixed alias for `sll $zero, $zero, 0`, the all-zero word.
            if !args.is_empty() {
                self.note_error(
                    AsmErrorKind::Instruction,
                    "Instruction takes no operands",
                    Some(mnemonic),
                );
            }
            let word = I_TYPE.encode(&[]);
            self.bytes.extend_from_slice(&word.to_be_bytes());
            return;
        }

        let Some(inst) = instructions::lookup(mnemonic) else {
            self.note_error(AsmErrorKind::Instruction, "Unknown instruction", Some(mnemonic));
            return;
        };

        let mut fields: Vec<(&'static str, i64)> = vec![("op", i64::from(inst.opcode))];
        if args.len() != inst.binding.operand_count() {
            let msg = format!(
                "Expected {} operands, found {}",
                inst.binding.operand_count(),
                args.len()
            );
            self.note_error(AsmErrorKind::Instruction, &msg, Some(mnemonic));
            // Operand fields stay zeroed so the emitted word is
            // deterministic.
        } else {
            match inst.binding {
                ArgBinding::RtRsImm => {
                    let rt = self.eval_plain(&args[0]);
                    let rs = self.eval_plain(&args[1]);
                    let imm = self.eval_plain(&args[2]);
                    fields.push(("rt", rt));
                    fields.push(("rs", rs));
                    fields.push(("imm", imm));
                }
                ArgBinding::RtImm => {
                    let rt = self.eval_plain(&args[0]);
                    let imm = self.eval_plain(&args[1]);
                    fields.push(("rt", rt));
                    fields.push(("imm", imm));
                }
                ArgBinding::RtImmOffsetRs => {
                    let rt = self.eval_plain(&args[0]);
                    let mem = self.eval_operand(&args[1]);
                    let imm = match mem.offset {
                        Some(offset) => offset,
                        None => {
                            self.note_error(
                                AsmErrorKind::Instruction,
                                "Operand expected base+offset form",
                                Some(&args[1]),
                            );
                            0
                        }
                    };
                    fields.push(("rt", rt));
                    fields.push(("rs", mem.value));
                    fields.push(("imm", imm));
                }
            }
        }

        let word = inst.format.encode(&fields);
        self.bytes.extend_from_slice(&word.to_be_bytes());
    }
}

fn is_valid_label(name: &str) -> bool {
    let mut bytes = name.bytes();
    match bytes.next() {
        Some(b) if b.is_ascii_alphabetic() || b == b'_' => {}
        _ => return false,
    }
    bytes.all(|b| b.is_ascii_alphanumeric() || b == b'_')
}

#[cfg(test)]
mod tests {
    use super::{
        first_pass, input_base_from_path, resolve_output_path, second_pass, AsmConfig, AsmLine,
        Assembler, Cli, ListingWriter, PassCounts, PassSymbols,
    };
    use crate::error::{AsmErrorKind, LineStatus, Severity};
    use crate::imagestore::IO_SPACE_SIZE;
    use crate::symbol_table::{RedefinePolicy, SymbolTable};
    use clap::Parser;
    use std::io;
    use std::path::PathBuf;

    fn assemble_with_config(src: &str, config: AsmConfig) -> (Assembler, PassCounts, PassCounts) {
        let mut assembler = Assembler::with_config(config);
        assembler.load_source_str(src).expect("load source");
        let mut listing = ListingWriter::new(io::sink());
        let (pass1, pass2) = assembler.assemble(&mut listing).expect("assemble");
        (assembler, pass1, pass2)
    }

    fn assemble_str(src: &str) -> (Assembler, PassCounts, PassCounts) {
        assemble_with_config(src, AsmConfig::default())
    }

    fn program_bytes(assembler: &Assembler) -> &[u8] {
        &assembler.image().bytes()[IO_SPACE_SIZE..]
    }

    #[test]
    fn cli_parses_inputs_and_options() {
        let cli = Cli::parse_from([
            "sbasm",
            "-i",
            "prog.s",
            "-o",
            "out",
            "-l",
            "-s",
            "2048",
            "-H",
            "64",
            "-e",
            "start",
            "--allow-label-redefinition",
        ]);
        assert_eq!(cli.infiles, vec![PathBuf::from("prog.s")]);
        assert_eq!(cli.outfile, Some("out".to_string()));
        assert_eq!(cli.list_name, Some(String::new()));
        assert_eq!(cli.stack_size, 2048);
        assert_eq!(cli.heap_size, 64);
        assert_eq!(cli.entry, "start");
        assert!(cli.allow_label_redefinition);

        let config = AsmConfig::from_cli(&cli);
        assert_eq!(config.redefine_policy, RedefinePolicy::Overwrite);
        assert_eq!(config.entry_label, "start");
    }

    #[test]
    fn input_base_requires_known_extension() {
        let err = input_base_from_path(&PathBuf::from("prog.txt")).unwrap_err();
        assert_eq!(err.to_string(), "Input file must end with .s or .asm");
        let (name, base) = input_base_from_path(&PathBuf::from("dir/prog.s")).unwrap();
        assert_eq!(name, "dir/prog.s");
        assert_eq!(base, "prog");
    }

    #[test]
    fn resolve_output_path_uses_base_on_empty_name() {
        assert_eq!(
            resolve_output_path("prog", Some(String::new()), "bin"),
            Some("prog.bin".to_string())
        );
    }

    #[test]
    fn resolve_output_path_preserves_extension() {
        assert_eq!(
            resolve_output_path("prog", Some("out.sbin".to_string()), "bin"),
            Some("out.sbin".to_string())
        );
    }

    #[test]
    fn resolve_output_path_appends_extension() {
        assert_eq!(
            resolve_output_path("prog", Some("out".to_string()), "bin"),
            Some("out.bin".to_string())
        );
    }

    #[test]
    fn label_binds_current_position() {
        let mut symbols = SymbolTable::new();
        let config = AsmConfig::default();
        let mut asm = AsmLine::new(PassSymbols::Collecting(&mut symbols), &config);
        let status = asm.process("main:", 0x100);
        assert_eq!(status, LineStatus::Ok);
        drop(asm);
        assert_eq!(symbols.lookup("main"), Some(0x100));
    }

    #[test]
    fn label_with_illegal_characters_is_an_error() {
        let mut symbols = SymbolTable::new();
        let config = AsmConfig::default();
        let mut asm = AsmLine::new(PassSymbols::Collecting(&mut symbols), &config);
        let status = asm.process("bad name:", 0x100);
        assert_eq!(status, LineStatus::Error);
        assert_eq!(asm.errors()[0].kind(), AsmErrorKind::Symbol);
    }

    #[test]
    fn scenario_addiu_program() {
        let (assembler, _, pass2) = assemble_str("main:\n    addiu $2, $0, 5\n");
        assert_eq!(pass2.errors, 0);
        assert_eq!(assembler.entry_address(), Some(IO_SPACE_SIZE as u32));
        assert_eq!(program_bytes(&assembler), &[0x24, 0x02, 0x00, 0x05]);
    }

    #[test]
    fn scenario_lui_defaults_other_fields() {
        let (assembler, _, pass2) = assemble_str("main:\n    lui $3, 0x1234\n");
        assert_eq!(pass2.errors, 0);
        assert_eq!(program_bytes(&assembler), &[0x3C, 0x03, 0x12, 0x34]);
    }

    #[test]
    fn load_and_store_use_base_plus_offset() {
        let (assembler, _, pass2) = assemble_str("main:\n    lw $2, 8($sp)\n    sw $2, 4($sp)\n");
        assert_eq!(pass2.errors, 0);
        assert_eq!(
            program_bytes(&assembler),
            &[0x8F, 0xA2, 0x00, 0x08, 0xAF, 0xA2, 0x00, 0x04]
        );
    }

    #[test]
    fn nop_is_the_zero_word() {
        let (assembler, _, pass2) = assemble_str("main:\n    nop\n");
        assert_eq!(pass2.errors, 0);
        assert_eq!(program_bytes(&assembler), &[0, 0, 0, 0]);
    }

    #[test]
    fn negative_immediate_wraps_in_field() {
        let (assembler, _, _) = assemble_str("main:\n    addiu $sp, $sp, -8\n");
        assert_eq!(program_bytes(&assembler), &[0x27, 0xBD, 0xFF, 0xF8]);
    }

    #[test]
    fn word_directive_emits_native_order() {
        let (assembler, _, pass2) = assemble_str("main:\n.word 42\n");
        assert_eq!(pass2.errors, 0);
        assert_eq!(program_bytes(&assembler), &[42, 0, 0, 0]);
    }

    #[test]
    fn word_directive_accepts_label_expression() {
        let (assembler, _, _) = assemble_str("main:\n.word main\n");
        assert_eq!(program_bytes(&assembler), &[0x00, 0x01, 0x00, 0x00]);
    }

    #[test]
    fn undefined_label_is_one_error_and_still_emits_a_word() {
        let (mut assembler, _, pass2) = assemble_str("main:\n    addiu $2, $0, undefined_label\n");
        assert_eq!(pass2.errors, 1);
        let diags = assembler.take_diagnostics();
        assert_eq!(diags.len(), 1);
        assert_eq!(diags[0].line(), 2);
        assert_eq!(diags[0].severity(), Severity::Error);
        assert!(diags[0].message().contains("undefined_label"));
        assert_eq!(program_bytes(&assembler), &[0x24, 0x02, 0x00, 0x00]);
    }

    #[test]
    fn unknown_instruction_emits_no_bytes() {
        let (mut assembler, _, pass2) = assemble_str("main:\n    frob $1\n    nop\n");
        assert_eq!(pass2.errors, 1);
        let diags = assembler.take_diagnostics();
        assert_eq!(diags.len(), 1);
        assert_eq!(diags[0].kind(), AsmErrorKind::Instruction);
        // The unknown line contributes nothing; the nop still lands right
        // after the I/O window.
        assert_eq!(program_bytes(&assembler), &[0, 0, 0, 0]);
    }

    #[test]
    fn wrong_operand_count_substitutes_zero_fields() {
        let (mut assembler, _, pass2) = assemble_str("main:\n    addiu $2, $0\n");
        assert_eq!(pass2.errors, 1);
        let diags = assembler.take_diagnostics();
        assert!(diags[0].message().contains("Expected 3 operands, found 2"));
        // The opcode field survives; operand fields are zero.
        assert_eq!(program_bytes(&assembler), &[0x24, 0x00, 0x00, 0x00]);
    }

    #[test]
    fn missing_offset_defaults_to_zero() {
        let (mut assembler, _, pass2) = assemble_str("main:\n    lw $2, 8\n");
        assert_eq!(pass2.errors, 1);
        let diags = assembler.take_diagnostics();
        assert!(diags[0].message().contains("base+offset"));
        // rs is the evaluated value, imm degrades to 0.
        assert_eq!(program_bytes(&assembler), &[0x8D, 0x02, 0x00, 0x00]);
    }

    #[test]
    fn unknown_directive_warns_exactly_once() {
        let (mut assembler, pass1, pass2) = assemble_str("main:\n.align 2\n    nop\n");
        assert_eq!(pass1.warnings, 1);
        assert_eq!(pass2.warnings, 0);
        let diags = assembler.take_diagnostics();
        assert_eq!(diags.len(), 1);
        assert_eq!(diags[0].severity(), Severity::Warning);
        assert!(diags[0].message().contains("align"));
        // Unknown directives contribute no bytes.
        assert_eq!(program_bytes(&assembler), &[0, 0, 0, 0]);
    }

    #[test]
    fn unknown_directive_warning_can_be_disabled() {
        let config = AsmConfig {
            warn_unknown_directive: false,
            ..AsmConfig::default()
        };
        let (mut assembler, pass1, _) = assemble_with_config("main:\n.align 2\n", config);
        assert_eq!(pass1.warnings, 0);
        assert!(assembler.take_diagnostics().is_empty());
    }

    #[test]
    fn duplicate_label_is_rejected_by_default() {
        let (mut assembler, pass1, _) = assemble_str("main:\n    nop\nmain:\n");
        assert_eq!(pass1.errors, 1);
        let diags = assembler.take_diagnostics();
        assert_eq!(diags.len(), 1);
        assert_eq!(diags[0].line(), 3);
        assert_eq!(diags[0].kind(), AsmErrorKind::Symbol);
        // First definition wins under the reject policy.
        assert_eq!(assembler.entry_address(), Some(IO_SPACE_SIZE as u32));
    }

    #[test]
    fn duplicate_label_overwrites_when_allowed() {
        let config = AsmConfig {
            redefine_policy: RedefinePolicy::Overwrite,
            ..AsmConfig::default()
        };
        let (mut assembler, pass1, _) = assemble_with_config("main:\n    nop\nmain:\n", config);
        assert_eq!(pass1.errors, 0);
        assert!(assembler.take_diagnostics().is_empty());
        assert_eq!(assembler.entry_address(), Some(IO_SPACE_SIZE as u32 + 4));
    }

    #[test]
    fn blank_lines_do_not_shift_diagnostic_line_numbers() {
        let (mut assembler, _, _) = assemble_str("main:\n\n\n    addiu $2, $0, nope\n");
        let diags = assembler.take_diagnostics();
        assert_eq!(diags.len(), 1);
        assert_eq!(diags[0].line(), 4);
    }

    #[test]
    fn label_lines_do_not_shift_diagnostic_line_numbers() {
        let (mut assembler, _, _) = assemble_str("main:\nspot:\n    addiu $2, $0, nope\n");
        let diags = assembler.take_diagnostics();
        assert_eq!(diags.len(), 1);
        assert_eq!(diags[0].line(), 3);
    }

    #[test]
    fn both_passes_end_at_the_same_position() {
        let config = AsmConfig::default();
        let src = [
            "main:",
            "    lui $2, %hi(buffer)",
            "    addiu $2, $2, %lo(buffer)",
            "    lw $3, 0($2)",
            ".word 99",
            "buffer:",
            "    .word 7",
        ]
        .map(str::to_string);
        let first = first_pass(&src, &config);
        let mut listing = ListingWriter::new(io::sink());
        let second = second_pass(&src, &first.symbols, &config, &mut listing).unwrap();
        assert_eq!(first.image_len, second.image.position());
    }

    #[test]
    fn forward_reference_resolves_like_backward() {
        let forward = "main:\n    addiu $2, $0, data\ndata:\n    .word 7\n";
        let backward = "data:\n    .word 7\nmain:\n    addiu $2, $0, data\n";

        let (fwd, _, fwd_counts) = assemble_str(forward);
        assert_eq!(fwd_counts.errors, 0);
        let fwd_addr = fwd.symbols().lookup("data").unwrap();
        let imm = u16::from_be_bytes(program_bytes(&fwd)[2..4].try_into().unwrap());
        assert_eq!(u32::from(imm), fwd_addr & 0xffff);

        let (bwd, _, bwd_counts) = assemble_str(backward);
        assert_eq!(bwd_counts.errors, 0);
        let bwd_addr = bwd.symbols().lookup("data").unwrap();
        let word_start = program_bytes(&bwd).len() - 4;
        let imm = u16::from_be_bytes(
            program_bytes(&bwd)[word_start + 2..word_start + 4]
                .try_into()
                .unwrap(),
        );
        assert_eq!(u32::from(imm), bwd_addr & 0xffff);
    }

    #[test]
    fn hi_lo_split_a_forward_label_address() {
        let src = "main:\n    lui $2, %hi(buffer)\n    addiu $2, $2, %lo(buffer)\nbuffer:\n";
        let (assembler, _, pass2) = assemble_str(src);
        assert_eq!(pass2.errors, 0);
        let addr = assembler.symbols().lookup("buffer").unwrap();
        assert_eq!(addr, IO_SPACE_SIZE as u32 + 8);
        let code = program_bytes(&assembler);
        let lui_imm = u16::from_be_bytes(code[2..4].try_into().unwrap());
        let addiu_imm = u16::from_be_bytes(code[6..8].try_into().unwrap());
        assert_eq!(u32::from(lui_imm), addr >> 16);
        assert_eq!(u32::from(addiu_imm), addr & 0xffff);
    }

    #[test]
    fn assemble_before_load_is_a_usage_error() {
        let mut assembler = Assembler::new();
        let mut listing = ListingWriter::new(io::sink());
        let err = assembler.assemble(&mut listing).unwrap_err();
        assert_eq!(err.kind(), AsmErrorKind::Usage);
    }

    #[test]
    fn assemble_twice_is_a_usage_error() {
        let mut assembler = Assembler::new();
        assembler.load_source_str("main:\n").unwrap();
        let mut listing = ListingWriter::new(io::sink());
        assembler.assemble(&mut listing).unwrap();
        let err = assembler.assemble(&mut listing).unwrap_err();
        assert_eq!(err.kind(), AsmErrorKind::Usage);
    }

    #[test]
    fn load_twice_is_a_usage_error() {
        let mut assembler = Assembler::new();
        assembler.load_source_str("main:\n").unwrap();
        let err = assembler.load_source_str("main:\n").unwrap_err();
        assert_eq!(err.kind(), AsmErrorKind::Usage);
    }

    #[test]
    fn windows_line_endings_are_normalized() {
        let (assembler, _, pass2) = assemble_str("main:\r\n    nop\r\n");
        assert_eq!(pass2.errors, 0);
        assert_eq!(program_bytes(&assembler), &[0, 0, 0, 0]);
    }

    #[test]
    fn entry_address_is_none_without_entry_label() {
        let (assembler, _, _) = assemble_str("start:\n    nop\n");
        assert_eq!(assembler.entry_address(), None);
    }

    #[test]
    fn diagnostics_are_sorted_by_line() {
        // The duplicate label surfaces in pass 1, the undefined label in
        // pass 2; reporting still orders them by source line.
        let src = "main:\n    addiu $2, $0, nope\n    nop\nmain:\n";
        let (mut assembler, _, _) = assemble_str(src);
        let diags = assembler.take_diagnostics();
        assert_eq!(diags.len(), 2);
        assert_eq!(diags[0].line(), 2);
        assert_eq!(diags[1].line(), 4);
    }

    #[test]
    fn listing_pairs_source_with_hex_and_binary() {
        let mut assembler = Assembler::new();
        assembler.load_source_str("main:\n    addiu $2, $0, 5\n").unwrap();
        let mut out = Vec::new();
        let mut listing = ListingWriter::new(&mut out);
        listing.header().unwrap();
        assembler.assemble(&mut listing).unwrap();
        let text = String::from_utf8(out).unwrap();
        assert!(text.contains("24 02 00 05"));
        assert!(text.contains("00100100 00000010 00000000 00000101"));
        assert!(text.contains("addiu $2, $0, 5"));
    }
}
