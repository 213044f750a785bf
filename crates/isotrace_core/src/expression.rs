//! Fields given as text, e.g. `u^2 + v^2 - r^2`.
//!
//! Expressions are parsed into an AST, compiled to stack bytecode and run
//! on [`Jet`] values, so value, gradient and Hessian are exact.

use std::collections::HashMap;

use anyhow::{anyhow, bail, Context};
use nalgebra::Vector2;

use crate::domain::{Domain, Periodicity};
use crate::error::{ExploreError, Result};
use crate::field::{FieldSample, ScalarField};
use crate::jet::Jet;

/// Instructions of the stack machine.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum OpCode {
    LoadConst(f64),
    /// 0 = u, 1 = v.
    LoadVar(usize),
    /// Index into the named constants.
    LoadParam(usize),
    Add,
    Sub,
    Mul,
    Div,
    Pow,
    Neg,
    Sin,
    Cos,
    Tan,
    Exp,
    Ln,
    Sqrt,
    Abs,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Bytecode {
    pub ops: Vec<OpCode>,
}

/// Stateless evaluator; the caller owns the stack buffer.
pub struct VM;

impl VM {
    /// Runs `bytecode`. Returns `None` when the stack does not hold exactly
    /// one value at the end.
    pub fn execute(bytecode: &Bytecode, vars: &[Jet; 2], params: &[f64], stack: &mut Vec<Jet>) -> Option<Jet> {
        stack.clear();
        for op in &bytecode.ops {
            let value = match *op {
                OpCode::LoadConst(c) => Jet::constant(c),
                OpCode::LoadVar(i) => *vars.get(i)?,
                OpCode::LoadParam(i) => Jet::constant(*params.get(i)?),
                OpCode::Add | OpCode::Sub | OpCode::Mul | OpCode::Div | OpCode::Pow => {
                    let b = stack.pop()?;
                    let a = stack.pop()?;
                    match op {
                        OpCode::Add => a + b,
                        OpCode::Sub => a - b,
                        OpCode::Mul => a * b,
                        OpCode::Div => a / b,
                        _ => a.powf(b),
                    }
                }
                unary => {
                    let a = stack.pop()?;
                    match unary {
                        OpCode::Neg => -a,
                        OpCode::Sin => a.sin(),
                        OpCode::Cos => a.cos(),
                        OpCode::Tan => a.tan(),
                        OpCode::Exp => a.exp(),
                        OpCode::Ln => a.ln(),
                        OpCode::Sqrt => a.sqrt(),
                        _ => a.abs(),
                    }
                }
            };
            stack.push(value);
        }
        match stack.len() {
            1 => stack.pop(),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Number(f64),
    Variable(String),
    Binary(Box<Expr>, char, Box<Expr>),
    Unary(char, Box<Expr>),
    Call(String, Box<Expr>),
}

/// Resolves names to variable and constant slots.
pub struct Compiler {
    pub var_map: HashMap<String, usize>,
    pub param_map: HashMap<String, usize>,
}

impl Compiler {
    pub fn new(param_names: &[String]) -> Self {
        let var_map = [("u".to_string(), 0), ("v".to_string(), 1)].into_iter().collect();
        let param_map = param_names
            .iter()
            .enumerate()
            .map(|(i, name)| (name.clone(), i))
            .collect();
        Self { var_map, param_map }
    }

    pub fn compile(&self, expr: &Expr) -> anyhow::Result<Bytecode> {
        let mut ops = Vec::new();
        self.compile_recursive(expr, &mut ops)?;
        Ok(Bytecode { ops })
    }

    fn compile_recursive(&self, expr: &Expr, ops: &mut Vec<OpCode>) -> anyhow::Result<()> {
        match expr {
            Expr::Number(n) => ops.push(OpCode::LoadConst(*n)),
            Expr::Variable(name) => {
                if let Some(&idx) = self.var_map.get(name) {
                    ops.push(OpCode::LoadVar(idx));
                } else if let Some(&idx) = self.param_map.get(name) {
                    ops.push(OpCode::LoadParam(idx));
                } else if name == "pi" {
                    ops.push(OpCode::LoadConst(std::f64::consts::PI));
                } else {
                    bail!("unknown variable or constant '{name}'");
                }
            }
            Expr::Binary(left, op, right) => {
                self.compile_recursive(left, ops)?;
                self.compile_recursive(right, ops)?;
                ops.push(match op {
                    '+' => OpCode::Add,
                    '-' => OpCode::Sub,
                    '*' => OpCode::Mul,
                    '/' => OpCode::Div,
                    '^' => OpCode::Pow,
                    _ => bail!("unknown binary operator '{op}'"),
                });
            }
            Expr::Unary(op, operand) => {
                self.compile_recursive(operand, ops)?;
                match op {
                    '-' => ops.push(OpCode::Neg),
                    _ => bail!("unknown unary operator '{op}'"),
                }
            }
            Expr::Call(func, arg) => {
                self.compile_recursive(arg, ops)?;
                ops.push(match func.as_str() {
                    "sin" => OpCode::Sin,
                    "cos" => OpCode::Cos,
                    "tan" => OpCode::Tan,
                    "exp" => OpCode::Exp,
                    "ln" => OpCode::Ln,
                    "sqrt" => OpCode::Sqrt,
                    "abs" => OpCode::Abs,
                    _ => bail!("unknown function '{func}'"),
                });
            }
        }
        Ok(())
    }
}

pub fn parse(input: &str) -> anyhow::Result<Expr> {
    let tokens = tokenize(input)?;
    let mut parser = Parser { tokens, pos: 0 };
    let expr = parser.parse_expression()?;
    if let Some(token) = parser.peek() {
        bail!("unexpected {token:?} after complete expression");
    }
    Ok(expr)
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Number(f64),
    Identifier(String),
    Plus,
    Minus,
    Star,
    Slash,
    Caret,
    LParen,
    RParen,
}

fn tokenize(input: &str) -> anyhow::Result<Vec<Token>> {
    let chars: Vec<char> = input.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        if c.is_whitespace() {
            i += 1;
        } else if c.is_ascii_digit() || c == '.' {
            let start = i;
            while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                i += 1;
            }
            // Exponent only when digits follow, so `2e` stays a product.
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
            let text: String = chars[start..i].iter().collect();
            let value = text
                .parse::<f64>()
                .with_context(|| format!("invalid number '{text}' at offset {start}"))?;
            tokens.push(Token::Number(value));
        } else if c.is_alphabetic() || c == '_' {
            let start = i;
            while i < chars.len() && (chars[i].is_alphanumeric() || chars[i] == '_') {
                i += 1;
            }
            tokens.push(Token::Identifier(chars[start..i].iter().collect()));
        } else {
            tokens.push(match c {
                '+' => Token::Plus,
                '-' => Token::Minus,
                '*' => Token::Star,
                '/' => Token::Slash,
                '^' => Token::Caret,
                '(' => Token::LParen,
                ')' => Token::RParen,
                _ => bail!("unexpected character '{c}' at offset {i}"),
            });
            i += 1;
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

    fn consume(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        if token.is_some() {
            self.pos += 1;
        }
        token
    }

    fn expect_rparen(&mut self) -> anyhow::Result<()> {
        match self.consume() {
            Some(Token::RParen) => Ok(()),
            other => Err(anyhow!("expected ')', found {other:?}")),
        }
    }

    fn parse_expression(&mut self) -> anyhow::Result<Expr> {
        let mut left = self.parse_product()?;
        loop {
            let op = match self.peek() {
                Some(Token::Plus) => '+',
                Some(Token::Minus) => '-',
                _ => break,
            };
            self.consume();
            let right = self.parse_product()?;
            left = Expr::Binary(Box::new(left), op, Box::new(right));
        }
        Ok(left)
    }

    fn parse_product(&mut self) -> anyhow::Result<Expr> {
        let mut left = self.parse_unary()?;
        loop {
            let op = match self.peek() {
                Some(Token::Star) => '*',
                Some(Token::Slash) => '/',
                _ => break,
            };
            self.consume();
            let right = self.parse_unary()?;
            left = Expr::Binary(Box::new(left), op, Box::new(right));
        }
        Ok(left)
    }

    /// Unary minus binds looser than `^`: `-u^2` is `-(u^2)`.
    fn parse_unary(&mut self) -> anyhow::Result<Expr> {
        if let Some(Token::Minus) = self.peek() {
            self.consume();
            let expr = self.parse_unary()?;
            return Ok(Expr::Unary('-', Box::new(expr)));
        }
        self.parse_power()
    }

    /// Right-associative: `u^2^3` is `u^(2^3)`.
    fn parse_power(&mut self) -> anyhow::Result<Expr> {
        let base = self.parse_primary()?;
        if let Some(Token::Caret) = self.peek() {
            self.consume();
            let exponent = self.parse_unary()?;
            return Ok(Expr::Binary(Box::new(base), '^', Box::new(exponent)));
        }
        Ok(base)
    }

    fn parse_primary(&mut self) -> anyhow::Result<Expr> {
        match self.consume() {
            Some(Token::Number(n)) => Ok(Expr::Number(n)),
            Some(Token::Identifier(name)) => {
                if let Some(Token::LParen) = self.peek() {
                    self.consume();
                    let arg = self.parse_expression()?;
                    self.expect_rparen()?;
                    Ok(Expr::Call(name, Box::new(arg)))
                } else {
                    Ok(Expr::Variable(name))
                }
            }
            Some(Token::LParen) => {
                let expr = self.parse_expression()?;
                self.expect_rparen()?;
                Ok(expr)
            }
            Some(other) => Err(anyhow!("unexpected token {other:?}")),
            None => Err(anyhow!("unexpected end of expression")),
        }
    }
}

/// A [`ScalarField`] compiled from an expression in `u`, `v` and named
/// constants. Reports exact derivatives up to the Hessian.
pub struct ExpressionField {
    source: String,
    domain: Domain,
    periodicity: Periodicity,
    bytecode: Bytecode,
    params: Vec<f64>,
    stack: Vec<Jet>,
}

impl ExpressionField {
    pub fn new(source: &str, domain: Domain) -> Result<Self> {
        Self::with_constants(source, domain, &[])
    }

    pub fn with_constants(source: &str, domain: Domain, constants: &[(&str, f64)]) -> Result<Self> {
        let names: Vec<String> = constants.iter().map(|(name, _)| name.to_string()).collect();
        let bytecode = parse(source)
            .and_then(|expr| Compiler::new(&names).compile(&expr))
            .with_context(|| format!("compiling '{source}'"))
            .map_err(|e| ExploreError::Expression(format!("{e:#}")))?;
        Ok(Self {
            source: source.to_string(),
            domain,
            periodicity: Periodicity::default(),
            bytecode,
            params: constants.iter().map(|(_, value)| *value).collect(),
            stack: Vec::new(),
        })
    }

    pub fn with_periodicity(mut self, periodicity: Periodicity) -> Self {
        self.periodicity = periodicity;
        self
    }

    pub fn source(&self) -> &str {
        &self.source
    }
}

impl ScalarField for ExpressionField {
    fn domain(&self) -> Domain {
        self.domain
    }

    fn evaluate(&mut self, uv: Vector2<f64>, _order: usize) -> FieldSample {
        let vars = [Jet::var_u(uv.x), Jet::var_v(uv.y)];
        match VM::execute(&self.bytecode, &vars, &self.params, &mut self.stack) {
            Some(jet) if jet.is_finite() => FieldSample::second_order(jet.val, jet.gradient(), jet.hessian()),
            _ => FieldSample::failed(),
        }
    }

    fn periodic_u(&self) -> bool {
        self.periodicity.u
    }

    fn periodic_v(&self) -> bool {
        self.periodicity.v
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    fn eval(source: &str, u: f64, v: f64) -> FieldSample {
        let mut field = ExpressionField::new(source, Domain::unit()).unwrap();
        field.evaluate(Vector2::new(u, v), 2)
    }

    #[test]
    fn precedence_and_associativity() {
        assert_abs_diff_eq!(eval("1 + 2 * 3", 0.0, 0.0).value, 7.0);
        assert_abs_diff_eq!(eval("-u^2", 3.0, 0.0).value, -9.0);
        assert_abs_diff_eq!(eval("2^3^2", 0.0, 0.0).value, 512.0);
        assert_abs_diff_eq!(eval("u - v - 1", 5.0, 1.0).value, 3.0);
        assert_abs_diff_eq!(eval("u^-1", 4.0, 0.0).value, 0.25);
    }

    #[test]
    fn scientific_notation() {
        assert_abs_diff_eq!(eval("2.5e-3 * u", 2.0, 0.0).value, 5e-3);
        assert_abs_diff_eq!(eval("1E2", 0.0, 0.0).value, 100.0);
    }

    #[test]
    fn exact_derivatives() {
        let s = eval("u^2 * v + sin(v)", 0.5, 0.3);
        assert_eq!(s.accurate, 3);
        assert_abs_diff_eq!(s.gradient.x, 2.0 * 0.5 * 0.3, epsilon = 1e-14);
        assert_abs_diff_eq!(s.gradient.y, 0.25 + 0.3f64.cos(), epsilon = 1e-14);
        assert_abs_diff_eq!(s.hessian[(0, 0)], 0.6, epsilon = 1e-14);
        assert_abs_diff_eq!(s.hessian[(0, 1)], 1.0, epsilon = 1e-14);
        assert_abs_diff_eq!(s.hessian[(1, 1)], -0.3f64.sin(), epsilon = 1e-14);
    }

    #[test]
    fn named_constants_and_pi() {
        let mut field =
            ExpressionField::with_constants("u^2 + v^2 - r^2", Domain::unit(), &[("r", 0.5)]).unwrap();
        assert_abs_diff_eq!(field.evaluate(Vector2::new(0.5, 0.0), 2).value, 0.0);
        assert_abs_diff_eq!(eval("cos(pi)", 0.0, 0.0).value, -1.0, epsilon = 1e-15);
    }

    #[test]
    fn malformed_expressions_are_errors() {
        for source in ["u +", "(u", "u $ v", "w * u", "foo(u)", "u v", "1.2.3"] {
            let result = ExpressionField::new(source, Domain::unit());
            assert!(
                matches!(result, Err(ExploreError::Expression(_))),
                "'{source}' should not compile"
            );
        }
    }

    #[test]
    fn non_finite_results_fail() {
        assert!(eval("ln(u)", 0.0, 0.5).is_failed());
        assert!(eval("sqrt(u - 1)", 0.5, 0.5).is_failed());
    }
}
