/// IRC message parsing and serialization.
///
/// Implements RFC 2812 message format:
///   [`:`prefix SPACE] command [SPACE params] [SPACE `:` trailing]
///
/// Messages are terminated by CR-LF (`\r\n`) on the wire,
/// but parsing operates on the content without the terminator.
use std::fmt;

/// A parsed IRC message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// Optional prefix (server name or `nick!user@host`).
    pub prefix: Option<String>,
    /// The command (e.g. `PRIVMSG`, `001`, `NICK`), uppercased.
    pub command: String,
    /// Parameters — the last may have been a trailing param (with spaces).
    pub params: Vec<String>,
}

/// Errors that can occur during message parsing.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    #[error("empty message")]
    Empty,
    #[error("prefix present but missing command")]
    MissingCommand,
    #[error("message contains NUL, CR or LF")]
    ForbiddenChar,
}

impl Message {
    /// Convenience constructor for proxy-synthesized messages.
    pub fn new(prefix: Option<&str>, command: &str, params: &[&str]) -> Self {
        Message {
            prefix: prefix.map(str::to_owned),
            command: command.to_owned(),
            params: params.iter().map(|p| (*p).to_owned()).collect(),
        }
    }

    /// Parse a single IRC message from a line.
    ///
    /// At most one trailing `\r\n` (or bare `\n`) is stripped; any CR, LF
    /// or NUL remaining after that is rejected, so a buffer holding two
    /// messages does not parse.
    pub fn parse(input: &str) -> Result<Self, ParseError> {
        let input = input
            .strip_suffix('\n')
            .map(|s| s.strip_suffix('\r').unwrap_or(s))
            .unwrap_or(input);

        if input.is_empty() {
            return Err(ParseError::Empty);
        }
        if input.contains(['\r', '\n', '\0']) {
            return Err(ParseError::ForbiddenChar);
        }

        let (prefix, rest) = if input.starts_with(':') {
            // Prefix runs until the first space.
            match input[1..].find(' ') {
                Some(idx) => (Some(input[1..=idx].to_owned()), &input[idx + 2..]),
                None => return Err(ParseError::MissingCommand),
            }
        } else {
            (None, input)
        };

        // Split into command and parameter portion.
        let (command, param_str) = match rest.find(' ') {
            Some(idx) => (&rest[..idx], Some(&rest[idx + 1..])),
            None => (rest, None),
        };

        if command.is_empty() {
            return Err(ParseError::MissingCommand);
        }

        let mut params = Vec::new();

        if let Some(mut remaining) = param_str {
            while !remaining.is_empty() {
                if remaining.starts_with(':') {
                    // Trailing parameter: everything after the colon, including spaces.
                    params.push(remaining[1..].to_owned());
                    break;
                }
                match remaining.find(' ') {
                    Some(idx) => {
                        params.push(remaining[..idx].to_owned());
                        remaining = &remaining[idx + 1..];
                    }
                    None => {
                        params.push(remaining.to_owned());
                        break;
                    }
                }
            }
        }

        Ok(Message {
            prefix,
            command: command.to_ascii_uppercase(),
            params,
        })
    }

    /// Serialize to the IRC wire format (without trailing `\r\n`).
    pub fn to_wire(&self) -> String {
        let mut out = String::new();

        if let Some(ref prefix) = self.prefix {
            out.push(':');
            out.push_str(prefix);
            out.push(' ');
        }

        out.push_str(&self.command);

        if !self.params.is_empty() {
            let last_idx = self.params.len() - 1;
            for (i, param) in self.params.iter().enumerate() {
                out.push(' ');
                if i == last_idx
                    && (param.is_empty() || param.contains(' ') || param.starts_with(':'))
                {
                    // Only the last parameter may hold spaces (or be empty),
                    // and then it must be sent as a trailing parameter.
                    out.push(':');
                }
                out.push_str(param);
            }
        }

        out
    }

    /// The nick portion of the prefix (`nick!user@host` or bare `nick`).
    pub fn prefix_nick(&self) -> Option<&str> {
        self.prefix
            .as_deref()
            .map(|p| p.split('!').next().unwrap_or(p))
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_wire())
    }
}
