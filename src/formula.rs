//! Component reduction formulas.
//!
//! A schema author may attach a formula to a component to control how the raw
//! entry is reduced into the component's contribution. The language is closed:
//!
//! - numeric literals (`5`, `0.5`, `.5`)
//! - the variables `raw`, `rawMax`, `totalMax`
//! - `sum(subScores)`, the only way `subScores` may appear
//! - `+ - * /`, unary minus and parentheses
//!
//! Formulas are parsed once into an [`Expr`] tree and evaluated per student.

use std::fmt;
use std::str::FromStr;

use thiserror::Error;

/// Longest formula source accepted, in bytes.
const MAX_FORMULA_LEN: usize = 1024;

/// Deepest run of nested parentheses or unary minus accepted.
const MAX_NESTING: usize = 64;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum FormulaError {
    #[error("parse error at {position}: {message}")]
    Parse { position: usize, message: String },

    #[error("unknown variable: {0}")]
    UnknownVariable(String),

    #[error("unknown function: {0}")]
    UnknownFunction(String),

    #[error("subScores is a list and can only be used as sum(subScores)")]
    ListInScalarContext,

    #[error("division by zero")]
    DivisionByZero,

    #[error("formula produced a non-finite result")]
    NonFinite,
}

impl FormulaError {
    /// Parse-time failures mean the formula can never evaluate.
    pub fn is_parse_error(&self) -> bool {
        matches!(
            self,
            FormulaError::Parse { .. }
                | FormulaError::UnknownVariable(_)
                | FormulaError::UnknownFunction(_)
                | FormulaError::ListInScalarContext
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Variable {
    Raw,
    RawMax,
    TotalMax,
}

impl Variable {
    pub fn name(self) -> &'static str {
        match self {
            Variable::Raw => "raw",
            Variable::RawMax => "rawMax",
            Variable::TotalMax => "totalMax",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
}

impl BinaryOp {
    fn symbol(self) -> char {
        match self {
            BinaryOp::Add => '+',
            BinaryOp::Sub => '-',
            BinaryOp::Mul => '*',
            BinaryOp::Div => '/',
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Literal(f64),
    Variable(Variable),
    Binary {
        op: BinaryOp,
        lhs: Box<Expr>,
        rhs: Box<Expr>,
    },
    Negate(Box<Expr>),
    SumSubScores,
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expr::Literal(v) => write!(f, "{}", v),
            Expr::Variable(v) => f.write_str(v.name()),
            Expr::Binary { op, lhs, rhs } => write!(f, "({} {} {})", lhs, op.symbol(), rhs),
            Expr::Negate(inner) => write!(f, "-{}", inner),
            Expr::SumSubScores => f.write_str("sum(subScores)"),
        }
    }
}

/// Values a formula can see for one student/component pair.
#[derive(Debug, Clone, Copy)]
pub struct FormulaContext<'a> {
    pub raw: f64,
    pub raw_max: f64,
    pub sub_scores: &'a [f64],
    pub total_max: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Formula {
    source: String,
    expr: Expr,
}

impl Formula {
    pub fn parse(source: &str) -> Result<Self, FormulaError> {
        // Evaluation recurses over the tree, so its size is capped here.
        if source.len() > MAX_FORMULA_LEN {
            return Err(FormulaError::Parse {
                position: MAX_FORMULA_LEN,
                message: format!("formula is longer than {} characters", MAX_FORMULA_LEN),
            });
        }
        let tokens = tokenize(source)?;
        let mut parser = Parser {
            tokens,
            pos: 0,
            end: source.len(),
            depth: 0,
        };
        let expr = parser.parse_formula()?;
        Ok(Self {
            source: source.trim().to_string(),
            expr,
        })
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn expr(&self) -> &Expr {
        &self.expr
    }

    pub fn eval(&self, ctx: &FormulaContext<'_>) -> Result<f64, FormulaError> {
        eval_expr(&self.expr, ctx)
    }

    /// Variable names referenced by the formula, in first-use order.
    pub fn variables(&self) -> Vec<&'static str> {
        let mut out: Vec<&'static str> = Vec::new();
        collect_variables(&self.expr, &mut out);
        out
    }
}

impl FromStr for Formula {
    type Err = FormulaError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Formula::parse(s)
    }
}

fn collect_variables(expr: &Expr, out: &mut Vec<&'static str>) {
    let name = match expr {
        Expr::Variable(v) => v.name(),
        Expr::SumSubScores => "subScores",
        _ => "",
    };
    if !name.is_empty() && !out.contains(&name) {
        out.push(name);
    }
    match expr {
        Expr::Literal(_) | Expr::Variable(_) | Expr::SumSubScores => {}
        Expr::Negate(inner) => collect_variables(inner, out),
        Expr::Binary { lhs, rhs, .. } => {
            collect_variables(lhs, out);
            collect_variables(rhs, out);
        }
    }
}

fn eval_expr(expr: &Expr, ctx: &FormulaContext<'_>) -> Result<f64, FormulaError> {
    let value = match expr {
        Expr::Literal(v) => *v,
        Expr::Variable(var) => match var {
            Variable::Raw => ctx.raw,
            Variable::RawMax => ctx.raw_max,
            Variable::TotalMax => ctx.total_max,
        },
        Expr::SumSubScores => ctx.sub_scores.iter().sum(),
        Expr::Negate(inner) => -eval_expr(inner, ctx)?,
        Expr::Binary { op, lhs, rhs } => {
            let l = eval_expr(lhs, ctx)?;
            let r = eval_expr(rhs, ctx)?;
            match op {
                BinaryOp::Add => l + r,
                BinaryOp::Sub => l - r,
                BinaryOp::Mul => l * r,
                BinaryOp::Div => {
                    if r == 0.0 {
                        return Err(FormulaError::DivisionByZero);
                    }
                    l / r
                }
            }
        }
    };
    if !value.is_finite() {
        return Err(FormulaError::NonFinite);
    }
    Ok(value)
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Number(f64),
    Ident(String),
    Plus,
    Minus,
    Star,
    Slash,
    LParen,
    RParen,
}

impl Token {
    fn describe(&self) -> String {
        match self {
            Token::Number(v) => format!("number {}", v),
            Token::Ident(name) => format!("'{}'", name),
            Token::Plus => "'+'".to_string(),
            Token::Minus => "'-'".to_string(),
            Token::Star => "'*'".to_string(),
            Token::Slash => "'/'".to_string(),
            Token::LParen => "'('".to_string(),
            Token::RParen => "')'".to_string(),
        }
    }
}

fn tokenize(src: &str) -> Result<Vec<(usize, Token)>, FormulaError> {
    let bytes = src.as_bytes();
    let mut out: Vec<(usize, Token)> = Vec::new();
    let mut i = 0usize;
    while i < bytes.len() {
        let c = bytes[i];
        let single = match c {
            b'+' => Some(Token::Plus),
            b'-' => Some(Token::Minus),
            b'*' => Some(Token::Star),
            b'/' => Some(Token::Slash),
            b'(' => Some(Token::LParen),
            b')' => Some(Token::RParen),
            _ => None,
        };
        if let Some(tok) = single {
            out.push((i, tok));
            i += 1;
            continue;
        }
        if c.is_ascii_whitespace() {
            i += 1;
            continue;
        }
        if c.is_ascii_digit() || c == b'.' {
            let start = i;
            let mut seen_dot = false;
            while i < bytes.len() && (bytes[i].is_ascii_digit() || (bytes[i] == b'.' && !seen_dot))
            {
                if bytes[i] == b'.' {
                    seen_dot = true;
                }
                i += 1;
            }
            let text = &src[start..i];
            let value: f64 = text.parse().map_err(|_| FormulaError::Parse {
                position: start,
                message: format!("invalid number '{}'", text),
            })?;
            out.push((start, Token::Number(value)));
            continue;
        }
        if c.is_ascii_alphabetic() || c == b'_' {
            let start = i;
            while i < bytes.len() && (bytes[i].is_ascii_alphanumeric() || bytes[i] == b'_') {
                i += 1;
            }
            out.push((start, Token::Ident(src[start..i].to_string())));
            continue;
        }
        // Only ASCII has been consumed so far, so `i` is a char boundary.
        let ch = src[i..].chars().next().unwrap_or('?');
        return Err(FormulaError::Parse {
            position: i,
            message: format!("unexpected character '{}'", ch),
        });
    }
    Ok(out)
}

struct Parser {
    tokens: Vec<(usize, Token)>,
    pos: usize,
    end: usize,
    depth: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos).map(|(_, t)| t)
    }

    fn position(&self) -> usize {
        self.tokens
            .get(self.pos)
            .map(|(p, _)| *p)
            .unwrap_or(self.end)
    }

    fn next(&mut self) -> Option<(usize, Token)> {
        let tok = self.tokens.get(self.pos).cloned();
        if tok.is_some() {
            self.pos += 1;
        }
        tok
    }

    fn error(&self, message: impl Into<String>) -> FormulaError {
        FormulaError::Parse {
            position: self.position(),
            message: message.into(),
        }
    }

    fn descend(&mut self) -> Result<(), FormulaError> {
        self.depth += 1;
        if self.depth > MAX_NESTING {
            return Err(self.error("formula nested too deeply"));
        }
        Ok(())
    }

    fn expect(&mut self, want: Token) -> Result<(), FormulaError> {
        match self.peek() {
            Some(t) if *t == want => {
                self.pos += 1;
                Ok(())
            }
            Some(t) => Err(self.error(format!(
                "expected {}, found {}",
                want.describe(),
                t.describe()
            ))),
            None => Err(self.error(format!("expected {}, found end of formula", want.describe()))),
        }
    }

    fn parse_formula(&mut self) -> Result<Expr, FormulaError> {
        if self.tokens.is_empty() {
            return Err(FormulaError::Parse {
                position: 0,
                message: "empty formula".to_string(),
            });
        }
        let expr = self.parse_additive()?;
        if let Some(t) = self.peek() {
            return Err(self.error(format!("unexpected {}", t.describe())));
        }
        Ok(expr)
    }

    fn parse_additive(&mut self) -> Result<Expr, FormulaError> {
        let mut lhs = self.parse_multiplicative()?;
        loop {
            let op = match self.peek() {
                Some(Token::Plus) => BinaryOp::Add,
                Some(Token::Minus) => BinaryOp::Sub,
                _ => return Ok(lhs),
            };
            self.pos += 1;
            let rhs = self.parse_multiplicative()?;
            lhs = Expr::Binary {
                op,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
            };
        }
    }

    fn parse_multiplicative(&mut self) -> Result<Expr, FormulaError> {
        let mut lhs = self.parse_unary()?;
        loop {
            let op = match self.peek() {
                Some(Token::Star) => BinaryOp::Mul,
                Some(Token::Slash) => BinaryOp::Div,
                _ => return Ok(lhs),
            };
            self.pos += 1;
            let rhs = self.parse_unary()?;
            lhs = Expr::Binary {
                op,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
            };
        }
    }

    fn parse_unary(&mut self) -> Result<Expr, FormulaError> {
        if self.peek() == Some(&Token::Minus) {
            self.pos += 1;
            self.descend()?;
            let inner = self.parse_unary()?;
            self.depth -= 1;
            return Ok(Expr::Negate(Box::new(inner)));
        }
        self.parse_primary()
    }

    fn parse_primary(&mut self) -> Result<Expr, FormulaError> {
        let Some((_, tok)) = self.next() else {
            return Err(self.error("unexpected end of formula"));
        };
        match tok {
            Token::Number(v) => Ok(Expr::Literal(v)),
            Token::LParen => {
                self.descend()?;
                let inner = self.parse_additive()?;
                self.expect(Token::RParen)?;
                self.depth -= 1;
                Ok(inner)
            }
            Token::Ident(name) => {
                if self.peek() == Some(&Token::LParen) {
                    self.parse_call(name)
                } else {
                    resolve_variable(&name)
                }
            }
            other => {
                self.pos -= 1;
                Err(self.error(format!("unexpected {}", other.describe())))
            }
        }
    }

    fn parse_call(&mut self, name: String) -> Result<Expr, FormulaError> {
        if name != "sum" {
            return Err(FormulaError::UnknownFunction(name));
        }
        self.expect(Token::LParen)?;
        match self.next() {
            Some((_, Token::Ident(arg))) if arg == "subScores" => {}
            Some((_, Token::Ident(arg))) if resolve_variable(&arg).is_err() => {
                return Err(FormulaError::UnknownVariable(arg));
            }
            Some(_) => {
                self.pos -= 1;
                return Err(self.error("sum() only accepts subScores"));
            }
            None => return Err(self.error("expected subScores, found end of formula")),
        }
        self.expect(Token::RParen)?;
        Ok(Expr::SumSubScores)
    }
}

fn resolve_variable(name: &str) -> Result<Expr, FormulaError> {
    match name {
        "raw" => Ok(Expr::Variable(Variable::Raw)),
        "rawMax" => Ok(Expr::Variable(Variable::RawMax)),
        "totalMax" => Ok(Expr::Variable(Variable::TotalMax)),
        "subScores" => Err(FormulaError::ListInScalarContext),
        _ => Err(FormulaError::UnknownVariable(name.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx(raw: f64, raw_max: f64, sub_scores: &[f64]) -> FormulaContext<'_> {
        FormulaContext {
            raw,
            raw_max,
            sub_scores,
            total_max: raw_max,
        }
    }

    fn approx(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-9
    }

    fn evaluate(source: &str, ctx: &FormulaContext<'_>) -> Result<f64, FormulaError> {
        Formula::parse(source)?.eval(ctx)
    }

    #[test]
    fn proportional_formula_scales_raw() {
        let f = Formula::parse("(raw / rawMax) * 5").expect("parse");
        assert!(approx(f.eval(&ctx(20.0, 40.0, &[])).expect("eval"), 2.5));
        assert!(approx(f.eval(&ctx(40.0, 40.0, &[])).expect("eval"), 5.0));
        assert!(approx(f.eval(&ctx(0.0, 40.0, &[])).expect("eval"), 0.0));
    }

    #[test]
    fn sum_of_sub_scores() {
        let subs = [5.0, 5.0, 5.0, 5.0, 10.0];
        let v = evaluate("(sum(subScores) / 30) * 5", &ctx(30.0, 30.0, &subs)).expect("eval");
        assert!(approx(v, 5.0));

        let v = evaluate("(sum(subScores) / totalMax) * 5", &ctx(30.0, 30.0, &subs)).expect("eval");
        assert!(approx(v, 5.0));
    }

    #[test]
    fn bare_variable_passes_through() {
        let v = evaluate("raw", &ctx(17.5, 20.0, &[])).expect("eval");
        assert!(approx(v, 17.5));
    }

    #[test]
    fn precedence_and_associativity() {
        let c = ctx(0.0, 0.0, &[]);
        assert!(approx(evaluate("2 + 3 * 4", &c).expect("eval"), 14.0));
        assert!(approx(evaluate("(2 + 3) * 4", &c).expect("eval"), 20.0));
        assert!(approx(evaluate("10 - 4 - 3", &c).expect("eval"), 3.0));
        assert!(approx(evaluate("24 / 4 / 2", &c).expect("eval"), 3.0));
        assert!(approx(evaluate("-2 * -3", &c).expect("eval"), 6.0));
        assert!(approx(evaluate(".5 * 4", &c).expect("eval"), 2.0));
    }

    #[test]
    fn reports_variables_in_first_use_order() {
        let f = Formula::parse("raw / rawMax + sum(subScores) - raw").expect("parse");
        assert_eq!(f.variables(), vec!["raw", "rawMax", "subScores"]);
    }

    #[test]
    fn rejects_unknown_names() {
        assert_eq!(
            Formula::parse("score * 2").unwrap_err(),
            FormulaError::UnknownVariable("score".to_string())
        );
        assert_eq!(
            Formula::parse("max(raw)").unwrap_err(),
            FormulaError::UnknownFunction("max".to_string())
        );
        assert_eq!(
            Formula::parse("subScores * 2").unwrap_err(),
            FormulaError::ListInScalarContext
        );
        assert_eq!(
            Formula::parse("sum(bogus)").unwrap_err(),
            FormulaError::UnknownVariable("bogus".to_string())
        );
    }

    #[test]
    fn rejects_malformed_input() {
        for src in ["", "   ", "(raw", "raw +", "raw raw", "1.2.3", "raw % 2", "sum(raw)", "sum subScores"] {
            let e = Formula::parse(src).unwrap_err();
            assert!(e.is_parse_error(), "{:?} should fail to parse, got {:?}", src, e);
        }
        match Formula::parse("raw $ 2").unwrap_err() {
            FormulaError::Parse { position, .. } => assert_eq!(position, 4),
            other => panic!("unexpected error {:?}", other),
        }
    }

    #[test]
    fn division_by_zero_is_an_evaluation_error() {
        let f = Formula::parse("raw / rawMax").expect("parse");
        let e = f.eval(&ctx(3.0, 0.0, &[])).unwrap_err();
        assert_eq!(e, FormulaError::DivisionByZero);
        assert!(!e.is_parse_error());
    }

    #[test]
    fn deep_nesting_is_a_parse_error() {
        let parens = format!("{}raw{}", "(".repeat(200), ")".repeat(200));
        match Formula::parse(&parens).unwrap_err() {
            FormulaError::Parse { message, .. } => assert_eq!(message, "formula nested too deeply"),
            other => panic!("unexpected error {:?}", other),
        }

        let minus = format!("{}raw", "-".repeat(500));
        match Formula::parse(&minus).unwrap_err() {
            FormulaError::Parse { message, .. } => assert_eq!(message, "formula nested too deeply"),
            other => panic!("unexpected error {:?}", other),
        }

        let shallow = format!("{}raw{}", "(".repeat(MAX_NESTING), ")".repeat(MAX_NESTING));
        let f = Formula::parse(&shallow).expect("parse");
        assert!(approx(f.eval(&ctx(3.0, 10.0, &[])).expect("eval"), 3.0));
    }

    #[test]
    fn oversized_source_is_rejected() {
        let long = vec!["raw"; 400].join(" + ");
        assert!(long.len() > MAX_FORMULA_LEN);
        let e = Formula::parse(&long).unwrap_err();
        assert!(e.is_parse_error());
        assert!(e.to_string().contains("longer than"), "{}", e);

        let huge = format!("{}raw", "-".repeat(200_000));
        assert!(Formula::parse(&huge).unwrap_err().is_parse_error());
    }

    #[test]
    fn display_round_trips_structure() {
        let f = Formula::parse("-(raw - 1) * 2").expect("parse");
        assert_eq!(f.expr().to_string(), "(-(raw - 1) * 2)");
    }
}
