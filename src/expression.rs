// Operand expression parsing and evaluation.

use crate::error::{AsmError, AsmErrorKind};
use crate::symbol_table::SymbolTable;

/// A resolved operand: an integer value plus an optional offset carried by
/// base+offset operands like `8($sp)`. For those, `value` is the base
/// register number and `offset` the displacement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct OperandValue {
    pub value: i64,
    pub offset: Option<i64>,
}

/// Register aliases accepted after `$`. Any other register reference must
/// be a numeric index 0-31.
const REGISTER_ALIASES: &[(&str, i64)] = &[
    ("zero", 0),
    ("gp", 28),
    ("sp", 29),
    ("fp", 30),
    ("ra", 31),
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Reloc {
    Hi,
    Lo,
}

#[derive(Debug, Clone, PartialEq)]
enum ExprToken {
    Int(i64),
    Register(i64),
    Ident(String),
    Reloc(Reloc),
    OpenParen,
    CloseParen,
    Plus,
    Minus,
    Star,
    Slash,
}

fn token_text(token: &ExprToken) -> String {
    match token {
        ExprToken::Int(n) => n.to_string(),
        ExprToken::Register(n) => format!("${n}"),
        ExprToken::Ident(name) => name.clone(),
        ExprToken::Reloc(Reloc::Hi) => "%hi".to_string(),
        ExprToken::Reloc(Reloc::Lo) => "%lo".to_string(),
        ExprToken::OpenParen => "(".to_string(),
        ExprToken::CloseParen => ")".to_string(),
        ExprToken::Plus => "+".to_string(),
        ExprToken::Minus => "-".to_string(),
        ExprToken::Star => "*".to_string(),
        ExprToken::Slash => "/".to_string(),
    }
}

/// Evaluate one operand expression.
///
/// With `symbols == None` (pass 1) every label resolves to a placeholder
/// of 0 so byte lengths can be determined before addresses are known.
/// With a table (pass 2) an unknown label is an error.
pub fn evaluate(expr: &str, symbols: Option<&SymbolTable>) -> Result<OperandValue, AsmError> {
    let tokens = tokenize(expr)?;
    if tokens.is_empty() {
        return Err(AsmError::new(
            AsmErrorKind::Expression,
            "Empty operand expression",
            None,
        ));
    }

    let mut eval = ExprEvaluator {
        tokens: &tokens,
        pos: 0,
        symbols,
    };
    let first = eval.eval_sums()?;

    let mut operand = OperandValue {
        value: first,
        offset: None,
    };
    if eval.peek() == Some(&ExprToken::OpenParen) {
        eval.advance();
        let base = match eval.take() {
            Some(ExprToken::Register(n)) => n,
            Some(other) => {
                return Err(AsmError::new(
                    AsmErrorKind::Expression,
                    "Base of base+offset operand must be a register, found",
                    Some(&token_text(&other)),
                ))
            }
            None => {
                return Err(AsmError::new(
                    AsmErrorKind::Expression,
                    "Base of base+offset operand must be a register",
                    None,
                ))
            }
        };
        eval.expect(ExprToken::CloseParen, "Expecting ')' after base register")?;
        operand = OperandValue {
            value: base,
            offset: Some(first),
        };
    }

    if let Some(extra) = eval.peek() {
        return Err(AsmError::new(
            AsmErrorKind::Expression,
            "Expecting end of expression, found",
            Some(&token_text(extra)),
        ));
    }
    Ok(operand)
}

fn tokenize(expr: &str) -> Result<Vec<ExprToken>, AsmError> {
    let bytes = expr.as_bytes();
    let mut tokens = Vec::new();
    let mut idx = 0;

    while idx < bytes.len() {
        let c = bytes[idx];
        match c {
            b' ' | b'\t' => idx += 1,
            b'(' => {
                tokens.push(ExprToken::OpenParen);
                idx += 1;
            }
            b')' => {
                tokens.push(ExprToken::CloseParen);
                idx += 1;
            }
            b'+' => {
                tokens.push(ExprToken::Plus);
                idx += 1;
            }
            b'-' => {
                tokens.push(ExprToken::Minus);
                idx += 1;
            }
            b'*' => {
                tokens.push(ExprToken::Star);
                idx += 1;
            }
            b'/' => {
                tokens.push(ExprToken::Slash);
                idx += 1;
            }
            b'$' => {
                let name = scan_word(bytes, idx + 1);
                idx += 1 + name.len();
                tokens.push(ExprToken::Register(register_number(&name)?));
            }
            b'%' => {
                let name = scan_word(bytes, idx + 1);
                idx += 1 + name.len();
                let reloc = match name.as_str() {
                    "hi" => Reloc::Hi,
                    "lo" => Reloc::Lo,
                    _ => {
                        return Err(AsmError::new(
                            AsmErrorKind::Expression,
                            "Unknown relocation operator",
                            Some(&format!("%{name}")),
                        ))
                    }
                };
                tokens.push(ExprToken::Reloc(reloc));
            }
            b'0'..=b'9' => {
                let text = scan_word(bytes, idx);
                idx += text.len();
                tokens.push(ExprToken::Int(parse_int(&text)?));
            }
            c if c.is_ascii_alphabetic() || c == b'_' => {
                let text = scan_word(bytes, idx);
                idx += text.len();
                tokens.push(ExprToken::Ident(text));
            }
            _ => {
                return Err(AsmError::new(
                    AsmErrorKind::Expression,
                    "Illegal character in expression",
                    Some(&expr[idx..]),
                ))
            }
        }
    }
    Ok(tokens)
}

/// Scan an identifier-shaped run (letters, digits, underscore) from `start`.
fn scan_word(bytes: &[u8], start: usize) -> String {
    let mut end = start;
    while end < bytes.len() && (bytes[end].is_ascii_alphanumeric() || bytes[end] == b'_') {
        end += 1;
    }
    String::from_utf8_lossy(&bytes[start..end]).to_string()
}

fn parse_int(text: &str) -> Result<i64, AsmError> {
    let parsed = if let Some(hex) = text.strip_prefix("0x").or_else(|| text.strip_prefix("0X")) {
        i64::from_str_radix(hex, 16)
    } else {
        text.parse::<i64>()
    };
    parsed.map_err(|_| {
        AsmError::new(
            AsmErrorKind::Expression,
            "Malformed integer constant",
            Some(text),
        )
    })
}

/// Resolve a register name (the part after `$`) to its index.
fn register_number(name: &str) -> Result<i64, AsmError> {
    if name.is_empty() {
        return Err(AsmError::new(
            AsmErrorKind::Expression,
            "Expecting register name after '$'",
            None,
        ));
    }
    if name.bytes().all(|b| b.is_ascii_digit()) {
        let index: i64 = name.parse().unwrap_or(i64::MAX);
        if index > 31 {
            return Err(AsmError::new(
                AsmErrorKind::Expression,
                "Register index must be 0-31",
                Some(&format!("${name}")),
            ));
        }
        return Ok(index);
    }
    REGISTER_ALIASES
        .iter()
        .find(|(alias, _)| *alias == name)
        .map(|(_, index)| *index)
        .ok_or_else(|| {
            AsmError::new(
                AsmErrorKind::Expression,
                "Unknown register name",
                Some(&format!("${name}")),
            )
        })
}

struct ExprEvaluator<'a> {
    tokens: &'a [ExprToken],
    pos: usize,
    symbols: Option<&'a SymbolTable>,
}

impl<'a> ExprEvaluator<'a> {
    fn peek(&self) -> Option<&ExprToken> {
        self.tokens.get(self.pos)
    }

    fn take(&mut self) -> Option<ExprToken> {
        let token = self.tokens.get(self.pos).cloned();
        if token.is_some() {
            self.pos += 1;
        }
        token
    }

    fn advance(&mut self) {
        self.pos += 1;
    }

    fn expect(&mut self, token: ExprToken, msg: &str) -> Result<(), AsmError> {
        match self.take() {
            Some(found) if found == token => Ok(()),
            Some(found) => Err(AsmError::new(
                AsmErrorKind::Expression,
                msg,
                Some(&token_text(&found)),
            )),
            None => Err(AsmError::new(AsmErrorKind::Expression, msg, None)),
        }
    }

    fn eval_sums(&mut self) -> Result<i64, AsmError> {
        let mut num1 = self.eval_factors()?;
        loop {
            match self.peek() {
                Some(ExprToken::Plus) => {
                    self.advance();
                    num1 = num1.wrapping_add(self.eval_factors()?);
                }
                Some(ExprToken::Minus) => {
                    self.advance();
                    num1 = num1.wrapping_sub(self.eval_factors()?);
                }
                _ => return Ok(num1),
            }
        }
    }

    fn eval_factors(&mut self) -> Result<i64, AsmError> {
        let mut num1 = self.eval_atom()?;
        loop {
            match self.peek() {
                Some(ExprToken::Star) => {
                    self.advance();
                    num1 = num1.wrapping_mul(self.eval_atom()?);
                }
                Some(ExprToken::Slash) => {
                    self.advance();
                    let num2 = self.eval_atom()?;
                    if num2 == 0 {
                        return Err(AsmError::new(
                            AsmErrorKind::Expression,
                            "Divide by zero",
                            None,
                        ));
                    }
                    num1 = num1.wrapping_div(num2);
                }
                _ => return Ok(num1),
            }
        }
    }

    fn eval_atom(&mut self) -> Result<i64, AsmError> {
        match self.take() {
            Some(ExprToken::Int(n)) => Ok(n),
            Some(ExprToken::Register(n)) => Ok(n),
            Some(ExprToken::Ident(name)) => match self.symbols {
                None => Ok(0),
                Some(table) => table.lookup(&name).map(i64::from).ok_or_else(|| {
                    AsmError::new(AsmErrorKind::Expression, "Label not defined", Some(&name))
                }),
            },
            Some(ExprToken::Reloc(reloc)) => {
                self.expect(
                    ExprToken::OpenParen,
                    "Expecting '(' after relocation operator",
                )?;
                let inner = self.eval_sums()?;
                self.expect(
                    ExprToken::CloseParen,
                    "Expecting ')' after relocation operand",
                )?;
                match reloc {
                    Reloc::Hi => Ok(i64::from((inner as u32) >> 16)),
                    Reloc::Lo => Ok(i64::from((inner as u32) & 0xffff)),
                }
            }
            Some(ExprToken::OpenParen) => {
                let inner = self.eval_sums()?;
                self.expect(
                    ExprToken::CloseParen,
                    "Expecting close parenthesis, found",
                )?;
                Ok(inner)
            }
            Some(ExprToken::Minus) => Ok(0i64.wrapping_sub(self.eval_atom()?)),
            Some(ExprToken::Plus) => self.eval_atom(),
            Some(other) => Err(AsmError::new(
                AsmErrorKind::Expression,
                "Expected label or numeric constant, found",
                Some(&token_text(&other)),
            )),
            None => Err(AsmError::new(
                AsmErrorKind::Expression,
                "Unexpected end of expression",
                None,
            )),
        }
    }
}
