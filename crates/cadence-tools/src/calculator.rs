use async_trait::async_trait;
use serde_json::{json, Value};

use cadence_types::{ToolResult, ToolSchema};

use crate::Tool;

/// Evaluates arithmetic expressions against an allowlist of operators,
/// functions, and constants. Faults are returned as output text so the agent
/// can read them and correct the expression.
pub struct CalculatorTool;

#[async_trait]
impl Tool for CalculatorTool {
    fn schema(&self) -> ToolSchema {
        ToolSchema {
            name: "calculator".to_string(),
            description: "Perform mathematical calculations. Supports +, -, *, /, %, ^, \
                          parentheses, functions (sqrt, sin, cos, tan, log, log10, exp, abs, \
                          round, floor, ceil, min, max, pow) and constants (pi, e)."
                .to_string(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "expression": {
                        "type": "string",
                        "description": "The expression to evaluate, e.g. `sqrt(144) + 2^10`"
                    }
                },
                "required": ["expression"]
            }),
        }
    }

    async fn execute(&self, args: Value) -> anyhow::Result<ToolResult> {
        let expression = args
            .get("expression")
            .and_then(|v| v.as_str())
            .unwrap_or("")
            .trim();
        if expression.is_empty() {
            return Ok(ToolResult {
                output: "Error: no expression provided.".to_string(),
                metadata: json!({}),
            });
        }

        match evaluate(expression) {
            Ok(value) => Ok(ToolResult {
                output: format_number(value),
                metadata: json!({"expression": expression}),
            }),
            Err(reason) => Ok(ToolResult {
                output: format!("Error evaluating expression: {reason}"),
                metadata: json!({"expression": expression}),
            }),
        }
    }
}

pub fn evaluate(input: &str) -> Result<f64, String> {
    let tokens = tokenize(input)?;
    let mut parser = Parser { tokens, pos: 0 };
    let value = parser.expression(0)?;
    if parser.pos != parser.tokens.len() {
        return Err(format!("unexpected trailing input near `{}`", parser.rest()));
    }
    if !value.is_finite() {
        return Err("result is not a finite number".to_string());
    }
    Ok(value)
}

fn format_number(value: f64) -> String {
    if value.fract() == 0.0 && value.abs() < 1e15 {
        format!("{}", value as i64)
    } else {
        format!("{value}")
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Number(f64),
    Ident(String),
    Plus,
    Minus,
    Star,
    Slash,
    Percent,
    Caret,
    LParen,
    RParen,
    Comma,
}

fn tokenize(input: &str) -> Result<Vec<Token>, String> {
    let mut tokens = Vec::new();
    let chars = input.chars().collect::<Vec<_>>();
    let mut i = 0usize;
    while i < chars.len() {
        let ch = chars[i];
        match ch {
            ' ' | '\t' | '\n' | '\r' => i += 1,
            '+' => {
                tokens.push(Token::Plus);
                i += 1;
            }
            '-' => {
                tokens.push(Token::Minus);
                i += 1;
            }
            '*' => {
                // `**` is accepted as an alias for `^`
                if chars.get(i + 1) == Some(&'*') {
                    tokens.push(Token::Caret);
                    i += 2;
                } else {
                    tokens.push(Token::Star);
                    i += 1;
                }
            }
            '/' => {
                tokens.push(Token::Slash);
                i += 1;
            }
            '%' => {
                tokens.push(Token::Percent);
                i += 1;
            }
            '^' => {
                tokens.push(Token::Caret);
                i += 1;
            }
            '(' => {
                tokens.push(Token::LParen);
                i += 1;
            }
            ')' => {
                tokens.push(Token::RParen);
                i += 1;
            }
            ',' => {
                tokens.push(Token::Comma);
                i += 1;
            }
            '0'..='9' | '.' => {
                let start = i;
                while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                    i += 1;
                }
                // scientific notation: 1e5, 2.5e-3
                if i < chars.len() && (chars[i] == 'e' || chars[i] == 'E') {
                    let mut j = i + 1;
                    if j < chars.len() && (chars[j] == '+' || chars[j] == '-') {
                        j += 1;
                    }
                    if j < chars.len() && chars[j].is_ascii_digit() {
                        i = j;
                        while i < chars.len() && chars[i].is_ascii_digit() {
                            i += 1;
                        }
                    }
                }
                let literal = chars[start..i].iter().collect::<String>();
                let value = literal
                    .parse::<f64>()
                    .map_err(|_| format!("invalid number `{literal}`"))?;
                tokens.push(Token::Number(value));
            }
            _ if ch.is_ascii_alphabetic() || ch == '_' => {
                let start = i;
                while i < chars.len() && (chars[i].is_ascii_alphanumeric() || chars[i] == '_') {
                    i += 1;
                }
                tokens.push(Token::Ident(chars[start..i].iter().collect()));
            }
            _ => return Err(format!("unsupported character `{ch}`")),
        }
    }
    Ok(tokens)
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        if token.is_some() {
            self.pos += 1;
        }
        token
    }

    fn rest(&self) -> String {
        format!("token {} of {}", self.pos + 1, self.tokens.len())
    }

    fn expression(&mut self, min_bp: u8) -> Result<f64, String> {
        let mut lhs = self.prefix()?;

        loop {
            let (op, left_bp, right_bp) = match self.peek() {
                Some(Token::Plus) => (Token::Plus, 1, 2),
                Some(Token::Minus) => (Token::Minus, 1, 2),
                Some(Token::Star) => (Token::Star, 3, 4),
                Some(Token::Slash) => (Token::Slash, 3, 4),
                Some(Token::Percent) => (Token::Percent, 3, 4),
                // right-associative
                Some(Token::Caret) => (Token::Caret, 6, 5),
                _ => break,
            };
            if left_bp < min_bp {
                break;
            }
            self.next();
            let rhs = self.expression(right_bp)?;
            lhs = match op {
                Token::Plus => lhs + rhs,
                Token::Minus => lhs - rhs,
                Token::Star => lhs * rhs,
                Token::Slash => {
                    if rhs == 0.0 {
                        return Err("division by zero".to_string());
                    }
                    lhs / rhs
                }
                Token::Percent => {
                    if rhs == 0.0 {
                        return Err("modulo by zero".to_string());
                    }
                    lhs % rhs
                }
                Token::Caret => lhs.powf(rhs),
                _ => unreachable!(),
            };
        }

        Ok(lhs)
    }

    fn prefix(&mut self) -> Result<f64, String> {
        match self.next() {
            Some(Token::Number(value)) => Ok(value),
            Some(Token::Minus) => Ok(-self.expression(5)?),
            Some(Token::Plus) => self.expression(5),
            Some(Token::LParen) => {
                let value = self.expression(0)?;
                match self.next() {
                    Some(Token::RParen) => Ok(value),
                    _ => Err("missing closing parenthesis".to_string()),
                }
            }
            Some(Token::Ident(name)) => {
                if self.peek() == Some(&Token::LParen) {
                    self.next();
                    let mut args = Vec::new();
                    if self.peek() != Some(&Token::RParen) {
                        loop {
                            args.push(self.expression(0)?);
                            match self.peek() {
                                Some(Token::Comma) => {
                                    self.next();
                                }
                                _ => break,
                            }
                        }
                    }
                    match self.next() {
                        Some(Token::RParen) => apply_function(&name, &args),
                        _ => Err(format!("missing closing parenthesis for `{name}(`")),
                    }
                } else {
                    constant(&name)
                }
            }
            other => Err(match other {
                Some(token) => format!("unexpected token {token:?}"),
                None => "unexpected end of expression".to_string(),
            }),
        }
    }
}

fn constant(name: &str) -> Result<f64, String> {
    match name {
        "pi" => Ok(std::f64::consts::PI),
        "e" => Ok(std::f64::consts::E),
        other => Err(format!("unknown constant `{other}`")),
    }
}

fn apply_function(name: &str, args: &[f64]) -> Result<f64, String> {
    let unary = |args: &[f64]| -> Result<f64, String> {
        match args {
            [x] => Ok(*x),
            _ => Err(format!("`{name}` expects exactly one argument")),
        }
    };
    match name {
        "abs" => Ok(unary(args)?.abs()),
        "sqrt" => {
            let x = unary(args)?;
            if x < 0.0 {
                return Err("sqrt of a negative number".to_string());
            }
            Ok(x.sqrt())
        }
        "sin" => Ok(unary(args)?.sin()),
        "cos" => Ok(unary(args)?.cos()),
        "tan" => Ok(unary(args)?.tan()),
        "log" => {
            let x = unary(args)?;
            if x <= 0.0 {
                return Err("log of a non-positive number".to_string());
            }
            Ok(x.ln())
        }
        "log10" => {
            let x = unary(args)?;
            if x <= 0.0 {
                return Err("log10 of a non-positive number".to_string());
            }
            Ok(x.log10())
        }
        "exp" => Ok(unary(args)?.exp()),
        "floor" => Ok(unary(args)?.floor()),
        "ceil" => Ok(unary(args)?.ceil()),
        "round" => Ok(unary(args)?.round()),
        "min" => {
            if args.is_empty() {
                return Err("`min` expects at least one argument".to_string());
            }
            Ok(args.iter().copied().fold(f64::INFINITY, f64::min))
        }
        "max" => {
            if args.is_empty() {
                return Err("`max` expects at least one argument".to_string());
            }
            Ok(args.iter().copied().fold(f64::NEG_INFINITY, f64::max))
        }
        "pow" => match args {
            [base, exponent] => Ok(base.powf(*exponent)),
            _ => Err("`pow` expects exactly two arguments".to_string()),
        },
        other => Err(format!("unknown function `{other}`")),
    }
}
