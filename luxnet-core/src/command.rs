//! Operator console commands and the errors shown back to the operator.

use crate::address::NodeAddress;
use crate::luminaire::History;
use crate::protocol::{ErrorCode, Field, Stream, Value, ValueType};

#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    /// `g <field> <id>`
    Get { field: Field, target: NodeAddress },
    /// `g b <u|y> <id>`
    History {
        series: History,
        target: NodeAddress,
    },
    /// `<field> <id> <value>`
    Set {
        field: Field,
        target: NodeAddress,
        value: Value,
    },
    /// `s <stream> <id>` starts, `S <stream> <id>` stops.
    Stream {
        start: bool,
        stream: Stream,
        target: NodeAddress,
    },
    /// `R`
    Reset,
}

/// Anything printed as an error line on the console.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ConsoleError {
    #[error("empty command")]
    Empty,
    #[error("unknown command '{0}'")]
    UnknownCommand(String),
    #[error("unknown field '{0}'")]
    UnknownField(String),
    #[error("missing {0}")]
    Missing(&'static str),
    #[error("invalid desk id '{0}'")]
    BadDeskId(String),
    #[error("invalid value '{0}'")]
    BadValue(String),
    #[error("invalid value for {field}: {code}")]
    Invalid { field: &'static str, code: ErrorCode },
    #[error("unknown desk {0}")]
    UnknownDesk(NodeAddress),
    #[error("streaming not supported for remote desks")]
    RemoteStream,
    #[error("buffer not available for remote desks")]
    RemoteHistory,
    #[error("no response from desk {0}")]
    Timeout(NodeAddress),
    #[error("failed to send command to desk {0}")]
    SendFailed(NodeAddress),
    #[error("desk {desk} rejected {field}: {code}")]
    Rejected {
        desk: NodeAddress,
        field: &'static str,
        code: ErrorCode,
    },
    #[error("calibration timed out")]
    CalibrationTimeout,
}

impl Command {
    /// Parse one console line. Values are range-checked here so a bad set never reaches
    /// the bus.
    pub fn parse(line: &str) -> Result<Command, ConsoleError> {
        let mut tokens = line.split_whitespace();
        let head = tokens.next().ok_or(ConsoleError::Empty)?;
        match head {
            "R" => Ok(Command::Reset),
            "g" => {
                let code = tokens.next().ok_or(ConsoleError::Missing("field"))?;
                if code == "b" {
                    let series = tokens.next().ok_or(ConsoleError::Missing("buffer"))?;
                    let series = History::from_code(series)
                        .ok_or_else(|| ConsoleError::UnknownField(series.to_string()))?;
                    let target = parse_target(tokens.next())?;
                    return Ok(Command::History { series, target });
                }
                let field = Field::from_code(code)
                    .ok_or_else(|| ConsoleError::UnknownField(code.to_string()))?;
                let target = parse_target(tokens.next())?;
                Ok(Command::Get { field, target })
            }
            "s" | "S" => {
                let code = tokens.next().ok_or(ConsoleError::Missing("stream"))?;
                let stream = Stream::from_code(code)
                    .ok_or_else(|| ConsoleError::UnknownField(code.to_string()))?;
                let target = parse_target(tokens.next())?;
                Ok(Command::Stream {
                    start: head == "s",
                    stream,
                    target,
                })
            }
            code => {
                let field = Field::from_code(code)
                    .filter(|f| f.is_settable())
                    .ok_or_else(|| ConsoleError::UnknownCommand(code.to_string()))?;
                let target = parse_target(tokens.next())?;
                let raw = tokens.next().ok_or(ConsoleError::Missing("value"))?;
                let value = parse_value(field, raw)?;
                field.validate(value).map_err(|code| ConsoleError::Invalid {
                    field: field.code(),
                    code,
                })?;
                Ok(Command::Set {
                    field,
                    target,
                    value,
                })
            }
        }
    }

    pub fn target(&self) -> Option<NodeAddress> {
        match self {
            Command::Get { target, .. }
            | Command::History { target, .. }
            | Command::Set { target, .. }
            | Command::Stream { target, .. } => Some(*target),
            Command::Reset => None,
        }
    }
}

fn parse_target(token: Option<&str>) -> Result<NodeAddress, ConsoleError> {
    let token = token.ok_or(ConsoleError::Missing("desk id"))?;
    token
        .parse::<u8>()
        .ok()
        .and_then(NodeAddress::new)
        .ok_or_else(|| ConsoleError::BadDeskId(token.to_string()))
}

fn parse_value(field: Field, raw: &str) -> Result<Value, ConsoleError> {
    let bad = || ConsoleError::BadValue(raw.to_string());
    match field.value_type() {
        ValueType::Flag => match raw {
            "0" => Ok(Value::Flag(false)),
            "1" => Ok(Value::Flag(true)),
            _ => Err(bad()),
        },
        ValueType::Float => raw.parse::<f32>().map(Value::Float).map_err(|_| bad()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(n: u8) -> NodeAddress {
        NodeAddress::new(n).unwrap()
    }

    #[test]
    fn parses_get() {
        assert_eq!(
            Command::parse("g y 2").unwrap(),
            Command::Get {
                field: Field::Illuminance,
                target: addr(2)
            }
        );
        assert_eq!(
            Command::parse("g L 1").unwrap(),
            Command::Get {
                field: Field::CurrentLowerBound,
                target: addr(1)
            }
        );
    }

    #[test]
    fn parses_buffer_get() {
        assert_eq!(
            Command::parse("g b u 3").unwrap(),
            Command::History {
                series: History::Duty,
                target: addr(3)
            }
        );
    }

    #[test]
    fn parses_set_and_checks_range() {
        assert_eq!(
            Command::parse("u 1 0.5").unwrap(),
            Command::Set {
                field: Field::Duty,
                target: addr(1),
                value: Value::Float(0.5)
            }
        );
        assert_eq!(
            Command::parse("o 4 1").unwrap(),
            Command::Set {
                field: Field::Occupancy,
                target: addr(4),
                value: Value::Flag(true)
            }
        );
        assert_eq!(
            Command::parse("u 1 1.5"),
            Err(ConsoleError::Invalid {
                field: "u",
                code: ErrorCode::OutOfRange
            })
        );
        assert!(matches!(
            Command::parse("O 1 0"),
            Err(ConsoleError::Invalid { .. })
        ));
        assert!(Command::parse("u 1 -1").is_ok());
    }

    #[test]
    fn read_only_fields_cannot_be_set() {
        assert_eq!(
            Command::parse("p 1 3"),
            Err(ConsoleError::UnknownCommand("p".into()))
        );
    }

    #[test]
    fn parses_streams() {
        assert_eq!(
            Command::parse("s all 1").unwrap(),
            Command::Stream {
                start: true,
                stream: Stream::All,
                target: addr(1)
            }
        );
        assert_eq!(
            Command::parse("S v 1").unwrap(),
            Command::Stream {
                start: false,
                stream: Stream::Voltage,
                target: addr(1)
            }
        );
    }

    #[test]
    fn rejects_bad_input() {
        assert_eq!(Command::parse("   "), Err(ConsoleError::Empty));
        assert_eq!(Command::parse("g"), Err(ConsoleError::Missing("field")));
        assert_eq!(
            Command::parse("g y 40"),
            Err(ConsoleError::BadDeskId("40".into()))
        );
        assert_eq!(
            Command::parse("g q 1"),
            Err(ConsoleError::UnknownField("q".into()))
        );
        assert_eq!(
            Command::parse("f 1 yes"),
            Err(ConsoleError::BadValue("yes".into()))
        );
        assert_eq!(Command::parse("R").unwrap(), Command::Reset);
    }

    #[test]
    fn error_lines_read_naturally() {
        assert_eq!(
            ConsoleError::Timeout(addr(2)).to_string(),
            "no response from desk 2"
        );
        assert_eq!(
            ConsoleError::SendFailed(addr(3)).to_string(),
            "failed to send command to desk 3"
        );
    }
}
