//! FILENAME: engine/src/reference_rewriter.rs
//! PURPOSE: Rewrites formula text when cells relocate or sheets rename.
//! CONTEXT: Moving or copying cells shifts every relative reference in
//! their formulas; renaming a sheet substitutes every qualifier naming it.
//! Rewriting operates on lexer tokens with byte spans, splicing
//! replacements into the original text, so whitespace, casing, and
//! everything else the user typed survives wherever a token was not
//! touched. Regex substitution over raw text is exactly the approach this
//! module exists to avoid: it cannot tell a sheet qualifier from a string
//! literal or a substring match.
//!
//! A shifted reference that leaves the grid is replaced, qualifier and
//! all, with the #REF! error literal, which keeps the formula parseable
//! and evaluates to a reference error.

use parser::lexer::Lexer;
use parser::token::Token;

use crate::coord::{col_to_index, index_to_col, shift_coords};

struct SpannedToken {
    token: Token,
    start: usize,
    end: usize,
}

/// A matched address inside the token stream, with the source spelling of
/// both components so untouched axes keep their casing.
struct MatchedAddress {
    col_letters: String,
    row_digits: String,
    col_abs: bool,
    row_abs: bool,
    /// Byte offset just past the address.
    end: usize,
    /// Token index just past the address.
    next_index: usize,
    /// Number of tokens the address itself spans.
    consumed: usize,
}

/// Shifts every relative reference in a formula by (dcol, drow).
/// Non-formula contents and zero shifts pass through unchanged.
pub fn shift_contents(contents: &str, dcol: i64, drow: i64) -> String {
    if !contents.starts_with('=') || (dcol == 0 && drow == 0) {
        return contents.to_string();
    }

    let tokens = tokenize(contents);
    let mut out = String::new();
    let mut upto = 0usize;
    let mut i = 0usize;

    while i < tokens.len() {
        // An address may carry a sheet qualifier: NAME ! ADDR
        let has_prefix = is_sheet_name(&tokens[i].token)
            && tokens.get(i + 1).is_some_and(|t| t.token == Token::Exclamation);
        let addr_index = if has_prefix { i + 2 } else { i };

        if let Some(addr) = match_address(contents, &tokens, addr_index) {
            // A bare ref-shaped identifier followed by '(' is a function
            // name (e.g. LOG10), not a reference.
            let is_function_name = !has_prefix
                && addr.consumed == 1
                && tokens
                    .get(addr_index + 1)
                    .is_some_and(|t| t.token == Token::LParen);

            if !is_function_name {
                let group_start = tokens[i].start;
                out.push_str(&contents[upto..group_start]);
                match shifted_address_text(&addr, dcol, drow) {
                    Some(addr_text) => {
                        // Sheet qualifier (if any) is copied verbatim
                        out.push_str(&contents[group_start..tokens[addr_index].start]);
                        out.push_str(&addr_text);
                    }
                    None => out.push_str("#REF!"),
                }
                upto = addr.end;
                i = addr.next_index;
                continue;
            }
        }

        i += 1;
    }

    out.push_str(&contents[upto..]);
    out
}

/// Replaces every sheet qualifier matching `old_name` (case-insensitive,
/// quoted or not) with `new_name`, quoting the new name exactly when it
/// needs it. Non-formula contents pass through unchanged.
pub fn rename_sheet_in_contents(contents: &str, old_name: &str, new_name: &str) -> String {
    if !contents.starts_with('=') {
        return contents.to_string();
    }

    let tokens = tokenize(contents);
    let old_key = old_name.to_lowercase();
    let mut out = String::new();
    let mut upto = 0usize;

    for i in 0..tokens.len() {
        let followed_by_bang = tokens
            .get(i + 1)
            .is_some_and(|t| t.token == Token::Exclamation);
        if !followed_by_bang {
            continue;
        }
        let name = match &tokens[i].token {
            Token::Identifier(name) | Token::QuotedIdentifier(name) => name,
            _ => continue,
        };
        if name.to_lowercase() == old_key {
            out.push_str(&contents[upto..tokens[i].start]);
            out.push_str(&quoted_sheet_name(new_name));
            upto = tokens[i].end;
        }
    }

    out.push_str(&contents[upto..]);
    out
}

/// Wraps a sheet name in single quotes iff it contains any character
/// outside [A-Za-z0-9_].
pub fn quoted_sheet_name(name: &str) -> String {
    let needs_quotes = name
        .chars()
        .any(|c| !(c.is_ascii_alphanumeric() || c == '_'));
    if needs_quotes {
        format!("'{}'", name)
    } else {
        name.to_string()
    }
}

fn tokenize(input: &str) -> Vec<SpannedToken> {
    let mut lexer = Lexer::new(input);
    let mut tokens = Vec::new();
    loop {
        let (token, start, end) = lexer.next_spanned();
        if token == Token::EOF {
            return tokens;
        }
        tokens.push(SpannedToken { token, start, end });
    }
}

fn is_sheet_name(token: &Token) -> bool {
    matches!(token, Token::Identifier(_) | Token::QuotedIdentifier(_))
}

/// True for text shaped like a cell reference: one to four letters then
/// one to four digits with no leading zero.
fn is_ref_shaped(text: &str) -> bool {
    let letters: String = text.chars().take_while(|c| c.is_ascii_alphabetic()).collect();
    let digits = &text[letters.len()..];
    !letters.is_empty()
        && letters.len() <= 4
        && !digits.is_empty()
        && digits.len() <= 4
        && !digits.starts_with('0')
        && digits.chars().all(|c| c.is_ascii_digit())
}

fn is_column_letters(text: &str) -> bool {
    !text.is_empty() && text.len() <= 4 && text.chars().all(|c| c.is_ascii_alphabetic())
}

fn is_row_digits(text: &str) -> bool {
    !text.is_empty()
        && text.len() <= 4
        && !text.starts_with('0')
        && text.chars().all(|c| c.is_ascii_digit())
}

/// Tries to match an address at token position `j`, in any of the forms
/// the lexer splits it into: A1 | A $1 | $ A1 | $ A $1.
fn match_address(src: &str, tokens: &[SpannedToken], j: usize) -> Option<MatchedAddress> {
    let col_abs = matches!(tokens.get(j)?.token, Token::Dollar);
    let ident_index = if col_abs { j + 1 } else { j };

    let ident = tokens.get(ident_index)?;
    if !matches!(ident.token, Token::Identifier(_)) {
        return None;
    }
    let ident_text = &src[ident.start..ident.end];

    if is_ref_shaped(ident_text) {
        let letters: String = ident_text
            .chars()
            .take_while(|c| c.is_ascii_alphabetic())
            .collect();
        let digits = ident_text[letters.len()..].to_string();
        let consumed = ident_index - j + 1;
        return Some(MatchedAddress {
            col_letters: letters,
            row_digits: digits,
            col_abs,
            row_abs: false,
            end: ident.end,
            next_index: ident_index + 1,
            consumed,
        });
    }

    // Column letters alone must be followed by $ROW
    if !is_column_letters(ident_text) {
        return None;
    }
    if !matches!(tokens.get(ident_index + 1)?.token, Token::Dollar) {
        return None;
    }
    let row = tokens.get(ident_index + 2)?;
    if !matches!(row.token, Token::Number(_)) {
        return None;
    }
    let row_text = &src[row.start..row.end];
    if !is_row_digits(row_text) {
        return None;
    }

    let consumed = ident_index + 3 - j;
    Some(MatchedAddress {
        col_letters: ident_text.to_string(),
        row_digits: row_text.to_string(),
        col_abs,
        row_abs: true,
        end: row.end,
        next_index: ident_index + 3,
        consumed,
    })
}

/// Rebuilds the address text after shifting its relative axes. Returns
/// None when the shifted address leaves the grid. Axes that do not move
/// keep their original spelling (and casing).
fn shifted_address_text(addr: &MatchedAddress, dcol: i64, drow: i64) -> Option<String> {
    let col_num = col_to_index(&addr.col_letters);
    let row_num: u32 = addr.row_digits.parse().ok()?;

    let (new_col, new_row) =
        shift_coords((col_num, row_num), dcol, drow, addr.col_abs, addr.row_abs)?;

    let col_text = if new_col == col_num {
        addr.col_letters.clone()
    } else {
        index_to_col(new_col)
    };
    let row_text = if new_row == row_num {
        addr.row_digits.clone()
    } else {
        new_row.to_string()
    };

    Some(format!(
        "{}{}{}{}",
        if addr.col_abs { "$" } else { "" },
        col_text,
        if addr.row_abs { "$" } else { "" },
        row_text
    ))
}
