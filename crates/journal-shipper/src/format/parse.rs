// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use super::spec::FormatSpec;
use super::{Candidate, Conversion, FieldGroup, Node, ParseError, Template};

struct Parser<'a> {
    input: &'a str,
    chars: Vec<(usize, char)>,
    pos: usize,
}

impl<'a> Parser<'a> {
    fn new(input: &'a str) -> Self {
        Self {
            input,
            chars: input.char_indices().collect(),
            pos: 0,
        }
    }

    fn peek(&self) -> Option<char> {
        self.chars.get(self.pos).map(|&(_, c)| c)
    }

    fn offset(&self) -> usize {
        self.chars
            .get(self.pos)
            .map_or(self.input.len(), |&(offset, _)| offset)
    }

    fn bump(&mut self) -> Option<char> {
        let c = self.peek();
        if c.is_some() {
            self.pos += 1;
        }
        c
    }

    fn template(mut self) -> Result<Template, ParseError> {
        let mut nodes = Vec::new();
        let mut literal = String::new();

        while let Some(c) = self.peek() {
            let offset = self.offset();
            self.bump();
            match c {
                '{' if self.peek() == Some('{') => {
                    self.bump();
                    literal.push('{');
                }
                '{' => {
                    if !literal.is_empty() {
                        nodes.push(Node::Literal(std::mem::take(&mut literal)));
                    }
                    nodes.push(Node::Field(self.field(offset)?));
                }
                '}' if self.peek() == Some('}') => {
                    self.bump();
                    literal.push('}');
                }
                '}' => return Err(ParseError::UnmatchedClosingBrace { position: offset }),
                c => literal.push(c),
            }
        }

        if !literal.is_empty() {
            nodes.push(Node::Literal(literal));
        }
        Ok(Template {
            source: self.input.to_string(),
            nodes,
        })
    }

    /// Parses the inside of a field group; the opening `{` at `open` has
    /// already been consumed.
    fn field(&mut self, open: usize) -> Result<FieldGroup, ParseError> {
        let body_start = self.offset();
        let mut candidates = vec![self.candidate(open)?];
        let mut conversion = None;
        let mut spec = None;

        loop {
            let offset = self.offset();
            match self.bump() {
                Some('|') if conversion.is_none() => candidates.push(self.candidate(open)?),
                Some('!') if conversion.is_none() => {
                    conversion = Some(match self.bump() {
                        Some('s') => Conversion::Str,
                        Some('r') => Conversion::Repr,
                        Some(found) => return Err(ParseError::InvalidConversion { found, position: offset + 1 }),
                        None => return Err(ParseError::UnclosedField { position: open }),
                    });
                    match self.peek() {
                        Some(':') | Some('}') => {}
                        Some(found) => {
                            return Err(ParseError::UnexpectedCharacter {
                                found,
                                position: self.offset(),
                            })
                        }
                        None => return Err(ParseError::UnclosedField { position: open }),
                    }
                }
                Some(':') => {
                    spec = Some(self.spec(open)?);
                    break;
                }
                Some('}') => break,
                Some(found) => return Err(ParseError::UnexpectedCharacter { found, position: offset }),
                None => return Err(ParseError::UnclosedField { position: open }),
            }
        }

        let body_end = self.chars[..self.pos]
            .last()
            .map_or(self.input.len(), |&(offset, _)| offset);
        Ok(FieldGroup {
            source: self.input[body_start..body_end].to_string(),
            candidates,
            conversion,
            spec,
        })
    }

    fn candidate(&mut self, open: usize) -> Result<Candidate, ParseError> {
        match self.peek() {
            Some(quote @ ('"' | '\'')) => {
                let start = self.offset();
                self.bump();
                let mut text = String::new();
                loop {
                    match self.bump() {
                        Some(c) if c == quote => break,
                        Some('|') => return Err(ParseError::DelimiterInLiteral { position: start }),
                        Some(c) => text.push(c),
                        None => return Err(ParseError::UnterminatedLiteral { position: start }),
                    }
                }
                match self.peek() {
                    Some('|' | '!' | ':' | '}') => Ok(Candidate::Literal(text)),
                    Some(found) => Err(ParseError::UnexpectedCharacter {
                        found,
                        position: self.offset(),
                    }),
                    None => Err(ParseError::UnclosedField { position: open }),
                }
            }
            _ => {
                let start = self.offset();
                let mut name = String::new();
                loop {
                    match self.peek() {
                        Some('|' | '!' | ':' | '}') => break,
                        Some('{') => return Err(ParseError::NestedField { position: self.offset() }),
                        Some(c) => {
                            name.push(c);
                            self.bump();
                        }
                        None => return Err(ParseError::UnclosedField { position: open }),
                    }
                }
                if !is_valid_name(&name) {
                    return Err(ParseError::InvalidFieldName { name, position: start });
                }
                Ok(Candidate::Field(name))
            }
        }
    }

    fn spec(&mut self, open: usize) -> Result<FormatSpec, ParseError> {
        let mut raw = String::new();
        loop {
            match self.bump() {
                Some('}') => break,
                Some('{') => {
                    return Err(ParseError::NestedField {
                        position: self.offset().saturating_sub(1),
                    })
                }
                Some(c) => raw.push(c),
                None => return Err(ParseError::UnclosedField { position: open }),
            }
        }
        FormatSpec::parse(&raw).map_err(|reason| ParseError::InvalidFormatSpec { spec: raw, reason })
    }
}

/// Identifier-like names, optionally `$`-prefixed. Empty and all-digit names
/// are accepted as well; they never resolve.
fn is_valid_name(name: &str) -> bool {
    if name.is_empty() || name.chars().all(|c| c.is_ascii_digit()) {
        return true;
    }
    let ident = name.strip_prefix('$').unwrap_or(name);
    let mut chars = ident.chars();
    match chars.next() {
        Some(first) if first.is_ascii_alphabetic() || first == '_' => {
            chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
        }
        _ => false,
    }
}

pub(super) fn parse(input: &str) -> Result<Template, ParseError> {
    Parser::new(input).template()
}
