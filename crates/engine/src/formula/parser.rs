// Formula parser - converts formula strings into AST
// Supports: numbers, cell refs (A1, $A$1), ranges (A1:B5), functions (SUM), math (+ - * / ^ %)
// Also supports: comparison operators (<, >, =, <=, >=, <>), string literals, concatenation (&)

use std::fmt;

use crate::cell_id::Coord;

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Number(f64),
    Text(String),
    Boolean(bool),
    CellRef(Coord),
    /// Rectangular range, normalized so `start` is the top-left corner.
    Range {
        start: Coord,
        end: Coord,
    },
    Function {
        name: String,
        args: Vec<Expr>,
    },
    BinaryOp {
        op: Op,
        left: Box<Expr>,
        right: Box<Expr>,
    },
    /// Bare identifier that is neither a function call nor a boolean (evaluates to #NAME)
    Name(String),
    /// Empty/omitted argument (e.g. the trailing slot in `=IF(a,b,)`)
    Empty,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    // Arithmetic
    Add,
    Sub,
    Mul,
    Div,
    // Comparison
    Lt,      // <
    Gt,      // >
    Eq,      // =
    LtEq,    // <=
    GtEq,    // >=
    NotEq,   // <>
    // String
    Concat,  // &
    // Exponentiation
    Pow,     // ^
}

/// Malformed formula text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseError {
    pub message: String,
}

impl ParseError {
    fn new(message: impl Into<String>) -> Self {
        Self { message: message.into() }
    }
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "parse error: {}", self.message)
    }
}

impl std::error::Error for ParseError {}

type ParseResult<T> = Result<T, ParseError>;

/// Parse a formula string (leading `=` required) into an AST.
pub fn parse(formula: &str) -> ParseResult<Expr> {
    let formula = formula.trim();
    let Some(input) = formula.strip_prefix('=') else {
        return Err(ParseError::new("Formula must start with ="));
    };

    let tokens = tokenize(input)?;
    if tokens.is_empty() {
        return Err(ParseError::new("Empty formula"));
    }
    parse_expr(&tokens)
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Number(f64),
    StringLit(String),
    CellRef(Coord),
    Ident(String),
    Plus,
    Minus,
    Star,
    Slash,
    LParen,
    RParen,
    Colon,
    Comma,
    // Comparison operators
    Lt,      // <
    Gt,      // >
    Eq,      // =
    LtEq,    // <=
    GtEq,    // >=
    NotEq,   // <>
    // String concatenation
    Ampersand, // &
    // Exponentiation and percent
    Caret,   // ^
    Percent, // %
}

fn tokenize(input: &str) -> ParseResult<Vec<Token>> {
    let mut tokens = Vec::new();
    let mut chars = input.chars().peekable();

    while let Some(&c) = chars.peek() {
        match c {
            ' ' | '\t' => { chars.next(); }
            '+' => { tokens.push(Token::Plus); chars.next(); }
            '-' => { tokens.push(Token::Minus); chars.next(); }
            '*' => { tokens.push(Token::Star); chars.next(); }
            '/' => { tokens.push(Token::Slash); chars.next(); }
            '(' => { tokens.push(Token::LParen); chars.next(); }
            ')' => { tokens.push(Token::RParen); chars.next(); }
            ':' => { tokens.push(Token::Colon); chars.next(); }
            ',' => { tokens.push(Token::Comma); chars.next(); }
            '&' => { tokens.push(Token::Ampersand); chars.next(); }
            '^' => { tokens.push(Token::Caret); chars.next(); }
            '%' => { tokens.push(Token::Percent); chars.next(); }
            '<' => {
                chars.next();
                match chars.peek() {
                    Some('=') => { tokens.push(Token::LtEq); chars.next(); }
                    Some('>') => { tokens.push(Token::NotEq); chars.next(); }
                    _ => tokens.push(Token::Lt),
                }
            }
            '>' => {
                chars.next();
                if let Some(&'=') = chars.peek() {
                    tokens.push(Token::GtEq);
                    chars.next();
                } else {
                    tokens.push(Token::Gt);
                }
            }
            '=' => { tokens.push(Token::Eq); chars.next(); }
            '"' => {
                // String literal; a doubled quote inside is an escaped quote
                chars.next();
                let mut s = String::new();
                loop {
                    match chars.next() {
                        Some('"') => {
                            if chars.peek() == Some(&'"') {
                                chars.next();
                                s.push('"');
                            } else {
                                break;
                            }
                        }
                        Some(ch) => s.push(ch),
                        None => return Err(ParseError::new("Unterminated string literal")),
                    }
                }
                tokens.push(Token::StringLit(s));
            }
            'A'..='Z' | 'a'..='z' | '$' => {
                // Cell reference (A1, $A$1) or function name (SUM)
                let mut ident = String::new();
                while let Some(&ch) = chars.peek() {
                    if ch.is_ascii_alphanumeric() || ch == '_' || ch == '$' {
                        ident.push(ch);
                        chars.next();
                    } else {
                        break;
                    }
                }

                if let Some(coord) = Coord::parse_a1(&ident) {
                    tokens.push(Token::CellRef(coord));
                } else if ident.contains('$') {
                    return Err(ParseError::new(format!("Invalid cell reference: {}", ident)));
                } else {
                    tokens.push(Token::Ident(ident.to_uppercase()));
                }
            }
            '0'..='9' | '.' => {
                let mut num_str = String::new();
                while let Some(&d) = chars.peek() {
                    if d.is_ascii_digit() || d == '.' {
                        num_str.push(d);
                        chars.next();
                    } else {
                        break;
                    }
                }
                // Scientific notation: 1e5, 2.5E-3
                if matches!(chars.peek(), Some('e') | Some('E')) {
                    let mut lookahead = chars.clone();
                    lookahead.next();
                    let mut exp = String::from("e");
                    if let Some(&sign @ ('+' | '-')) = lookahead.peek() {
                        exp.push(sign);
                        lookahead.next();
                    }
                    if lookahead.peek().map_or(false, |d| d.is_ascii_digit()) {
                        while let Some(&d) = lookahead.peek() {
                            if d.is_ascii_digit() {
                                exp.push(d);
                                lookahead.next();
                            } else {
                                break;
                            }
                        }
                        num_str.push_str(&exp);
                        chars = lookahead;
                    }
                }
                let num: f64 = num_str
                    .parse()
                    .map_err(|_| ParseError::new(format!("Invalid number: {}", num_str)))?;
                tokens.push(Token::Number(num));
            }
            _ => return Err(ParseError::new(format!("Unexpected character: {}", c))),
        }
    }

    Ok(tokens)
}

/// Deepest expression nesting accepted. Parentheses, unary signs, function
/// calls and each chained binary operator count one level.
pub const MAX_NESTING: usize = 256;

fn parse_expr(tokens: &[Token]) -> ParseResult<Expr> {
    let mut parser = Parser { tokens, depth: 0 };
    let (expr, pos) = parser.parse_comparison(0)?;
    if pos < tokens.len() {
        return Err(ParseError::new(format!("Unexpected token at position {}", pos)));
    }
    Ok(expr)
}

fn binary(op: Op, left: Expr, right: Expr) -> Expr {
    Expr::BinaryOp {
        op,
        left: Box::new(left),
        right: Box::new(right),
    }
}

struct Parser<'a> {
    tokens: &'a [Token],
    depth: usize,
}

impl Parser<'_> {
    fn enter(&mut self) -> ParseResult<()> {
        self.depth += 1;
        if self.depth > MAX_NESTING {
            return Err(ParseError::new("Formula nested too deeply"));
        }
        Ok(())
    }

    /// Run `f` one level deeper. An error ends the whole parse, so the
    /// depth is only restored on success.
    fn nested<T>(&mut self, f: impl FnOnce(&mut Self) -> ParseResult<T>) -> ParseResult<T> {
        self.enter()?;
        let result = f(self)?;
        self.depth -= 1;
        Ok(result)
    }

    // Lowest precedence: comparison operators
    fn parse_comparison(&mut self, pos: usize) -> ParseResult<(Expr, usize)> {
        let outer = self.depth;
        let (mut left, mut pos) = self.parse_concat(pos)?;

        while pos < self.tokens.len() {
            let op = match &self.tokens[pos] {
                Token::Lt => Op::Lt,
                Token::Gt => Op::Gt,
                Token::Eq => Op::Eq,
                Token::LtEq => Op::LtEq,
                Token::GtEq => Op::GtEq,
                Token::NotEq => Op::NotEq,
                _ => break,
            };
            self.enter()?;
            let (right, new_pos) = self.parse_concat(pos + 1)?;
            left = binary(op, left, right);
            pos = new_pos;
        }

        self.depth = outer;
        Ok((left, pos))
    }

    // String concatenation (&)
    fn parse_concat(&mut self, pos: usize) -> ParseResult<(Expr, usize)> {
        let outer = self.depth;
        let (mut left, mut pos) = self.parse_add_sub(pos)?;

        while let Some(Token::Ampersand) = self.tokens.get(pos) {
            self.enter()?;
            let (right, new_pos) = self.parse_add_sub(pos + 1)?;
            left = binary(Op::Concat, left, right);
            pos = new_pos;
        }

        self.depth = outer;
        Ok((left, pos))
    }

    fn parse_add_sub(&mut self, pos: usize) -> ParseResult<(Expr, usize)> {
        let outer = self.depth;
        let (mut left, mut pos) = self.parse_mul_div(pos)?;

        while pos < self.tokens.len() {
            let op = match &self.tokens[pos] {
                Token::Plus => Op::Add,
                Token::Minus => Op::Sub,
                _ => break,
            };
            self.enter()?;
            let (right, new_pos) = self.parse_mul_div(pos + 1)?;
            left = binary(op, left, right);
            pos = new_pos;
        }

        self.depth = outer;
        Ok((left, pos))
    }

    fn parse_mul_div(&mut self, pos: usize) -> ParseResult<(Expr, usize)> {
        let outer = self.depth;
        let (mut left, mut pos) = self.parse_power(pos)?;

        while pos < self.tokens.len() {
            let op = match &self.tokens[pos] {
                Token::Star => Op::Mul,
                Token::Slash => Op::Div,
                _ => break,
            };
            self.enter()?;
            let (right, new_pos) = self.parse_power(pos + 1)?;
            left = binary(op, left, right);
            pos = new_pos;
        }

        self.depth = outer;
        Ok((left, pos))
    }

    // Exponentiation (^) - right-associative, higher precedence than * /
    fn parse_power(&mut self, pos: usize) -> ParseResult<(Expr, usize)> {
        let (base, pos) = self.parse_percent(pos)?;

        if let Some(Token::Caret) = self.tokens.get(pos) {
            let (exponent, new_pos) = self.nested(|p| p.parse_power(pos + 1))?;
            return Ok((binary(Op::Pow, base, exponent), new_pos));
        }

        Ok((base, pos))
    }

    // Percent postfix (%) - desugars to * 0.01
    fn parse_percent(&mut self, pos: usize) -> ParseResult<(Expr, usize)> {
        let outer = self.depth;
        let (mut expr, mut pos) = self.parse_primary(pos)?;

        while let Some(Token::Percent) = self.tokens.get(pos) {
            self.enter()?;
            expr = binary(Op::Mul, expr, Expr::Number(0.01));
            pos += 1;
        }

        self.depth = outer;
        Ok((expr, pos))
    }

    fn parse_primary(&mut self, pos: usize) -> ParseResult<(Expr, usize)> {
        let tokens = self.tokens;
        let Some(token) = tokens.get(pos) else {
            return Err(ParseError::new("Unexpected end of expression"));
        };

        match token {
            Token::Number(n) => Ok((Expr::Number(*n), pos + 1)),
            Token::StringLit(s) => Ok((Expr::Text(s.clone()), pos + 1)),
            Token::CellRef(start) => {
                if let (Some(Token::Colon), Some(Token::CellRef(end))) =
                    (tokens.get(pos + 1), tokens.get(pos + 2))
                {
                    return Ok((normalized_range(*start, *end), pos + 3));
                }
                if let Some(Token::Colon) = tokens.get(pos + 1) {
                    return Err(ParseError::new("Range must end with a cell reference"));
                }
                Ok((Expr::CellRef(*start), pos + 1))
            }
            Token::Ident(name) => {
                if name == "TRUE" {
                    return Ok((Expr::Boolean(true), pos + 1));
                }
                if name == "FALSE" {
                    return Ok((Expr::Boolean(false), pos + 1));
                }
                if let Some(Token::LParen) = tokens.get(pos + 1) {
                    let (args, new_pos) = self.nested(|p| p.parse_function_args(pos + 2))?;
                    return Ok((
                        Expr::Function {
                            name: name.clone(),
                            args,
                        },
                        new_pos,
                    ));
                }
                Ok((Expr::Name(name.clone()), pos + 1))
            }
            Token::LParen => {
                let (expr, pos) = self.nested(|p| p.parse_comparison(pos + 1))?;
                match tokens.get(pos) {
                    Some(Token::RParen) => Ok((expr, pos + 1)),
                    Some(_) => Err(ParseError::new("Expected closing parenthesis")),
                    None => Err(ParseError::new("Missing closing parenthesis")),
                }
            }
            Token::Plus => {
                // Unary plus (no-op)
                self.nested(|p| p.parse_percent(pos + 1))
            }
            Token::Minus => {
                // Unary minus binds tighter than ^ in spreadsheet grammar: -2^2 = 4
                let (expr, pos) = self.nested(|p| p.parse_percent(pos + 1))?;
                Ok((binary(Op::Sub, Expr::Number(0.0), expr), pos))
            }
            _ => Err(ParseError::new(format!("Unexpected token at position {}", pos))),
        }
    }

    fn parse_function_args(&mut self, pos: usize) -> ParseResult<(Vec<Expr>, usize)> {
        let tokens = self.tokens;
        let mut args = Vec::new();
        let mut pos = pos;

        // Handle empty function call SUM()
        if let Some(Token::RParen) = tokens.get(pos) {
            return Ok((args, pos + 1));
        }

        loop {
            // Empty argument: next token is , or ) immediately
            match tokens.get(pos) {
                Some(Token::RParen) => {
                    args.push(Expr::Empty);
                    return Ok((args, pos + 1));
                }
                Some(Token::Comma) => {
                    args.push(Expr::Empty);
                    pos += 1;
                    continue;
                }
                _ => {}
            }

            let (arg, new_pos) = self.parse_comparison(pos)?;
            args.push(arg);
            pos = new_pos;

            match tokens.get(pos) {
                Some(Token::RParen) => return Ok((args, pos + 1)),
                Some(Token::Comma) => pos += 1,
                Some(_) => return Err(ParseError::new("Expected comma or closing parenthesis")),
                None => return Err(ParseError::new("Missing closing parenthesis in function call")),
            }
        }
    }
}

fn normalized_range(a: Coord, b: Coord) -> Expr {
    Expr::Range {
        start: Coord::new(a.row.min(b.row), a.col.min(b.col)),
        end: Coord::new(a.row.max(b.row), a.col.max(b.col)),
    }
}
