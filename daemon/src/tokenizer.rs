//! Shell-like command line splitting that never involves a shell.
//!
//! The line is split on ASCII spaces into nodes (runs of spaces collapse,
//! even inside quotes), then a two-state machine walks the nodes and glues
//! them back together while a `'` or `"` quote is open. Quote characters that delimit a token are stripped; quotes of the
//! other kind nested inside a token are kept verbatim.
//!
//! Malformed quoting never fails:
//!   - a stray close quote (`stray"`) is trimmed off its node,
//!   - re-opening the already open quote (`"a "b"`) closes it,
//!   - an unterminated quote runs to the end of the line.

/// A quote character that can open a multi-node token.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Quote {
    Single,
    Double,
}

impl Quote {
    fn from_char(c: char) -> Option<Self> {
        match c {
            '\'' => Some(Quote::Single),
            '"' => Some(Quote::Double),
            _ => None,
        }
    }

    fn as_char(self) -> char {
        match self {
            Quote::Single => '\'',
            Quote::Double => '"',
        }
    }
}

/// Walker state between two nodes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum State {
    /// Not inside any quote.
    Unquoted,
    /// Inside `quote`; `pending` holds the token text gathered so far.
    Quoted { quote: Quote, pending: String },
}

/// Splits `line` into an argument vector.
///
/// ```text
/// run top sub -a "the a message" --foo val1 --bar "val 2"
///   => [run, top, sub, -a, the a message, --foo, val1, --bar, val 2]
/// ```
pub fn tokenize(line: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut state = State::Unquoted;

    for node in line.trim().split(' ').filter(|n| !n.is_empty()) {
        state = step(state, node, &mut tokens);
    }

    // Unterminated quote: keep what was gathered.
    if let State::Quoted { pending, .. } = state {
        if !pending.is_empty() {
            tokens.push(pending);
        }
    }

    tokens
}

/// Splits `line` into a program name and its arguments.
///
/// An empty or whitespace-only line yields an empty program name.
pub fn bin_and_args(line: &str) -> (String, Vec<String>) {
    let mut tokens = tokenize(line).into_iter();
    let program = tokens.next().unwrap_or_default();
    (program, tokens.collect())
}

/// Feeds one non-empty node through the state machine, pushing any token it
/// completes onto `tokens`, and returns the next state.
pub fn step(state: State, node: &str, tokens: &mut Vec<String>) -> State {
    let first = node.chars().next().and_then(Quote::from_char);
    let last = node.chars().next_back().and_then(Quote::from_char);

    match state {
        State::Unquoted => match (first, last) {
            // Self-contained quoted word: `"msg"`.
            (Some(open), Some(close)) if open == close && node.len() >= 2 => {
                tokens.push(node[1..node.len() - 1].to_string());
                State::Unquoted
            }
            (Some(open), _) => State::Quoted {
                quote: open,
                pending: node[1..].to_string(),
            },
            // Close quote with nothing open.
            (None, Some(_)) => {
                tokens.push(node[..node.len() - 1].to_string());
                State::Unquoted
            }
            (None, None) => {
                tokens.push(node.to_string());
                State::Unquoted
            }
        },
        State::Quoted { quote, mut pending } => {
            if first == Some(quote) {
                // Same quote opened again while open: treat as the close.
                tokens.push(join_pending(&pending, node.trim_matches(quote.as_char())));
                State::Unquoted
            } else if last == Some(quote) {
                tokens.push(join_pending(&pending, &node[..node.len() - 1]));
                State::Unquoted
            } else {
                pending.push(' ');
                pending.push_str(node);
                State::Quoted { quote, pending }
            }
        }
    }
}

fn join_pending(pending: &str, node: &str) -> String {
    if pending.is_empty() {
        node.to_string()
    } else {
        format!("{pending} {node}")
    }
}
