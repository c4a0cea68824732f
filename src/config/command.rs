//! Parameter-letter commands such as `M669 K14 A-115:74:260 P1500`.
//!
//! This is the runtime configuration surface of the kinematics. Every
//! parameter is one letter followed by a value; multi-value parameters
//! separate their values with `:`. Text after `;` is a comment.

use crate::error::{ConfigError, Error, Result};

/// Maximum number of parameters on one command line.
pub const MAX_PARAMS: usize = 26;

/// Parameters of one command, borrowed from the command text.
#[derive(Debug, Clone, Default)]
pub struct CommandParams<'a> {
    params: heapless::Vec<(char, &'a str), MAX_PARAMS>,
}

impl<'a> CommandParams<'a> {
    /// Empty parameter set.
    pub fn new() -> Self {
        Self {
            params: heapless::Vec::new(),
        }
    }

    /// Parse whitespace separated parameters.
    pub fn parse(text: &'a str) -> Result<Self> {
        let text = strip_comment(text);
        let mut params = Self::new();
        for token in text.split_whitespace() {
            let mut chars = token.chars();
            let letter = match chars.next() {
                Some(c) if c.is_ascii_alphabetic() => c.to_ascii_uppercase(),
                _ => return Err(parse_error("parameter must start with a letter")),
            };
            params
                .params
                .push((letter, chars.as_str()))
                .map_err(|_| parse_error("too many parameters"))?;
        }
        Ok(params)
    }

    /// Whether no parameters were given.
    pub fn is_empty(&self) -> bool {
        self.params.is_empty()
    }

    /// Whether a parameter letter is present.
    pub fn seen(&self, letter: char) -> bool {
        self.raw(letter).is_some()
    }

    /// Letters present, in command order.
    pub fn letters(&self) -> impl Iterator<Item = char> + '_ {
        self.params.iter().map(|(c, _)| *c)
    }

    fn raw(&self, letter: char) -> Option<&'a str> {
        let letter = letter.to_ascii_uppercase();
        self.params
            .iter()
            .find(|(c, _)| *c == letter)
            .map(|(_, v)| *v)
    }

    /// Read a float parameter if present.
    pub fn get_f32(&self, letter: char) -> Result<Option<f32>> {
        self.raw(letter)
            .map(|v| parse_f32(letter, v))
            .transpose()
    }

    /// Read an unsigned integer parameter if present.
    pub fn get_u32(&self, letter: char) -> Result<Option<u32>> {
        self.raw(letter)
            .map(|v| parse_u32(letter, v))
            .transpose()
    }

    /// Update `dest` from a float parameter, setting `seen` when present.
    pub fn try_get_f32(&self, letter: char, dest: &mut f32, seen: &mut bool) -> Result<()> {
        if let Some(v) = self.get_f32(letter)? {
            *dest = v;
            *seen = true;
        }
        Ok(())
    }

    /// Update `dest` from a parameter holding exactly `N` float values.
    ///
    /// `dest` is untouched when the parameter is absent or malformed.
    pub fn try_get_f32_array<const N: usize>(
        &self,
        letter: char,
        dest: &mut [f32; N],
        seen: &mut bool,
    ) -> Result<()> {
        if let Some(raw) = self.raw(letter) {
            let mut values = [0.0f32; N];
            fill_values(letter, raw, &mut values, parse_f32)?;
            *dest = values;
            *seen = true;
        }
        Ok(())
    }

    /// Update `dest` from a parameter holding exactly `N` unsigned values.
    pub fn try_get_u32_array<const N: usize>(
        &self,
        letter: char,
        dest: &mut [u32; N],
        seen: &mut bool,
    ) -> Result<()> {
        if let Some(raw) = self.raw(letter) {
            let mut values = [0u32; N];
            fill_values(letter, raw, &mut values, parse_u32)?;
            *dest = values;
            *seen = true;
        }
        Ok(())
    }
}

/// One parsed command line.
#[derive(Debug, Clone)]
pub struct Command<'a> {
    /// Command number, for example 669.
    pub code: u16,
    /// Parameters after the command word.
    pub params: CommandParams<'a>,
}

impl<'a> Command<'a> {
    /// Parse a line such as `M666 Q0.007 R15:15:15:15:15:15:15:15`.
    ///
    /// Blank and comment-only lines yield `Ok(None)`.
    pub fn parse(line: &'a str) -> Result<Option<Self>> {
        let line = strip_comment(line).trim();
        if line.is_empty() {
            return Ok(None);
        }
        let (word, rest) = match line.find(char::is_whitespace) {
            Some(i) => (&line[..i], &line[i..]),
            None => (line, ""),
        };
        let code = word
            .strip_prefix('M')
            .or_else(|| word.strip_prefix('m'))
            .and_then(|n| n.parse::<u16>().ok())
            .ok_or_else(|| parse_error("expected an M command"))?;
        Ok(Some(Self {
            code,
            params: CommandParams::parse(rest)?,
        }))
    }
}

fn strip_comment(text: &str) -> &str {
    match text.find(';') {
        Some(i) => &text[..i],
        None => text,
    }
}

fn fill_values<T: Copy, const N: usize>(
    letter: char,
    raw: &str,
    values: &mut [T; N],
    parse: fn(char, &str) -> Result<T>,
) -> Result<()> {
    let mut found = 0;
    for part in raw.split(':') {
        if found < N {
            values[found] = parse(letter, part)?;
        }
        found += 1;
    }
    if found != N {
        return Err(ConfigError::WrongValueCount {
            letter,
            expected: N,
            found,
        }
        .into());
    }
    Ok(())
}

fn parse_f32(letter: char, text: &str) -> Result<f32> {
    match text.trim().parse::<f32>() {
        Ok(v) if v.is_finite() => Ok(v),
        _ => Err(ConfigError::InvalidNumber(letter).into()),
    }
}

fn parse_u32(letter: char, text: &str) -> Result<u32> {
    text.trim()
        .parse::<u32>()
        .map_err(|_| ConfigError::InvalidNumber(letter).into())
}

fn parse_error(msg: &str) -> Error {
    Error::Config(ConfigError::ParseError(
        heapless::String::try_from(msg).unwrap_or_default(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_command_with_arrays() {
        let cmd = Command::parse("M669 K14 A-115:74:260 P1500 ; anchors")
            .unwrap()
            .unwrap();
        assert_eq!(cmd.code, 669);
        assert_eq!(cmd.params.get_u32('K').unwrap(), Some(14));
        assert_eq!(cmd.params.get_f32('P').unwrap(), Some(1500.0));

        let mut anchor = [0.0; 3];
        let mut seen = false;
        cmd.params.try_get_f32_array('A', &mut anchor, &mut seen).unwrap();
        assert!(seen);
        assert_eq!(anchor, [-115.0, 74.0, 260.0]);
    }

    #[test]
    fn test_wrong_value_count_leaves_destination() {
        let params = CommandParams::parse("R15:15:15").unwrap();
        let mut radii = [1.0; 8];
        let mut seen = false;
        let err = params.try_get_f32_array('R', &mut radii, &mut seen).unwrap_err();

        assert_eq!(
            err,
            Error::Config(ConfigError::WrongValueCount {
                letter: 'R',
                expected: 8,
                found: 3
            })
        );
        assert!(!seen);
        assert_eq!(radii, [1.0; 8]);
    }

    #[test]
    fn test_invalid_number() {
        let params = CommandParams::parse("Qabc U2:x").unwrap();
        assert!(matches!(
            params.get_f32('Q'),
            Err(Error::Config(ConfigError::InvalidNumber('Q')))
        ));
        let mut adv = [0u32; 2];
        let mut seen = false;
        assert!(params.try_get_u32_array('U', &mut adv, &mut seen).is_err());
    }

    #[test]
    fn test_blank_and_comment_lines() {
        assert!(Command::parse("").unwrap().is_none());
        assert!(Command::parse("; Reprope parameters").unwrap().is_none());
        assert!(Command::parse("G1 X10").is_err());
    }

    #[test]
    fn test_lower_case_letters() {
        let params = CommandParams::parse("s200 t0.5").unwrap();
        assert!(params.seen('S'));
        assert_eq!(params.get_f32('t').unwrap(), Some(0.5));
    }
}
