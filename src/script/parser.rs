//! Recursive-descent parser for test scripts
//!
//! ```text
//! statement := "let" IDENT "=" expr
//!            | "test" STRING ":" expr
//!            | "assert" expr ["," expr]
//!            | "print" expr {"," expr}
//! expr      := or
//! or        := and {"||" and}
//! and       := cmp {"&&" cmp}
//! cmp       := sum [("=="|"!="|"<"|"<="|">"|">="|"contains"|"matches"|"startsWith"|"endsWith"|"in") sum]
//! sum       := product {("+"|"-") product}
//! product   := unary {("*"|"/") unary}
//! unary     := ("!"|"-") unary | postfix
//! postfix   := primary {"." IDENT | "[" expr "]"}
//! primary   := NUMBER | STRING | "true" | "false" | "null" | IDENT ["(" args ")"]
//!            | "(" expr ")" | "[" args "]" | "{" pairs "}"
//! ```

use super::lexer::{tokenize, Token};
use super::ScriptError;
use serde_json::Value;

/// Deepest expression a script may nest
pub const MAX_DEPTH: usize = 128;

/// An expression and the depth of its tree
type Parsed = (Expr, usize);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinOp {
  Eq,
  NotEq,
  Lt,
  Le,
  Gt,
  Ge,
  Add,
  Sub,
  Mul,
  Div,
  Contains,
  Matches,
  StartsWith,
  EndsWith,
  In,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnOp {
  Not,
  Neg,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
  Literal(Value),
  Var(String),
  Member(Box<Expr>, String),
  Index(Box<Expr>, Box<Expr>),
  List(Vec<Expr>),
  Object(Vec<(String, Expr)>),
  Call(String, Vec<Expr>),
  Unary(UnOp, Box<Expr>),
  Binary(BinOp, Box<Expr>, Box<Expr>),
  And(Box<Expr>, Box<Expr>),
  Or(Box<Expr>, Box<Expr>),
}

#[derive(Debug, Clone, PartialEq)]
pub enum StmtKind {
  Let(String, Expr),
  Test(String, Expr),
  Assert(Expr, Option<Expr>),
  Print(Vec<Expr>),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Stmt {
  pub line: usize,
  pub kind: StmtKind,
}

/// Parse a whole script; the first syntax error wins
pub fn parse(source: &str) -> Result<Vec<Stmt>, ScriptError> {
  let mut statements = Vec::new();
  for (index, line) in source.lines().enumerate() {
    let line_no = index + 1;
    let tokens = tokenize(line, line_no)?;
    if tokens.is_empty() {
      continue;
    }
    let mut parser = Parser {
      tokens,
      pos: 0,
      line: line_no,
      nesting: 0,
    };
    let kind = parser.statement()?;
    if parser.pos < parser.tokens.len() {
      return Err(parser.error(format!("unexpected {:?}", parser.tokens[parser.pos])));
    }
    statements.push(Stmt { line: line_no, kind });
  }
  Ok(statements)
}

struct Parser {
  tokens: Vec<Token>,
  pos: usize,
  line: usize,
  nesting: usize,
}

impl Parser {
  fn error(&self, msg: impl Into<String>) -> ScriptError {
    ScriptError::syntax(self.line, msg)
  }

  fn peek(&self) -> Option<&Token> {
    self.tokens.get(self.pos)
  }

  fn next(&mut self) -> Option<Token> {
    let token = self.tokens.get(self.pos).cloned();
    self.pos += 1;
    token
  }

  fn eat(&mut self, expected: &Token) -> bool {
    if self.peek() == Some(expected) {
      self.pos += 1;
      true
    } else {
      false
    }
  }

  fn expect(&mut self, expected: Token) -> Result<(), ScriptError> {
    if self.eat(&expected) {
      Ok(())
    } else {
      Err(self.error(format!("expected {:?}", expected)))
    }
  }

  fn statement(&mut self) -> Result<StmtKind, ScriptError> {
    let Some(Token::Ident(keyword)) = self.next() else {
      return Err(self.error("expected let, test, assert or print"));
    };
    match keyword.as_str() {
      "let" => {
        let Some(Token::Ident(name)) = self.next() else {
          return Err(self.error("expected a variable name after let"));
        };
        if matches!(name.as_str(), "request" | "response" | "rule") {
          return Err(self.error(format!("{} is read-only", name)));
        }
        self.expect(Token::Assign)?;
        Ok(StmtKind::Let(name, self.expr()?))
      }
      "test" => {
        let Some(Token::Str(name)) = self.next() else {
          return Err(self.error("expected a quoted test name"));
        };
        self.expect(Token::Colon)?;
        Ok(StmtKind::Test(name, self.expr()?))
      }
      "assert" => {
        let condition = self.expr()?;
        let message = if self.eat(&Token::Comma) {
          Some(self.expr()?)
        } else {
          None
        };
        Ok(StmtKind::Assert(condition, message))
      }
      "print" => {
        let mut args = vec![self.expr()?];
        while self.eat(&Token::Comma) {
          args.push(self.expr()?);
        }
        Ok(StmtKind::Print(args))
      }
      other => Err(self.error(format!("unknown statement {}", other))),
    }
  }

  fn too_deep(&self) -> ScriptError {
    self.error(format!("expression nests deeper than {} levels", MAX_DEPTH))
  }

  /// Depth of a node built over children at most `child` deep
  fn node(&self, child: usize) -> Result<usize, ScriptError> {
    if child + 1 > MAX_DEPTH {
      Err(self.too_deep())
    } else {
      Ok(child + 1)
    }
  }

  /// Enter a construct that recurses, such as parentheses, which may not
  /// build a node of its own
  fn descend(&mut self) -> Result<(), ScriptError> {
    if self.nesting >= MAX_DEPTH {
      return Err(self.too_deep());
    }
    self.nesting += 1;
    Ok(())
  }

  fn expr(&mut self) -> Result<Expr, ScriptError> {
    self.nested().map(|(expr, _)| expr)
  }

  fn nested(&mut self) -> Result<Parsed, ScriptError> {
    self.descend()?;
    let parsed = self.or();
    self.nesting -= 1;
    parsed
  }

  fn or(&mut self) -> Result<Parsed, ScriptError> {
    let (mut left, mut depth) = self.and()?;
    while self.eat(&Token::OrOr) {
      let (right, right_depth) = self.and()?;
      depth = self.node(depth.max(right_depth))?;
      left = Expr::Or(Box::new(left), Box::new(right));
    }
    Ok((left, depth))
  }

  fn and(&mut self) -> Result<Parsed, ScriptError> {
    let (mut left, mut depth) = self.comparison()?;
    while self.eat(&Token::AndAnd) {
      let (right, right_depth) = self.comparison()?;
      depth = self.node(depth.max(right_depth))?;
      left = Expr::And(Box::new(left), Box::new(right));
    }
    Ok((left, depth))
  }

  fn comparison(&mut self) -> Result<Parsed, ScriptError> {
    let (left, left_depth) = self.sum()?;
    let op = match self.peek() {
      Some(Token::EqEq) => BinOp::Eq,
      Some(Token::NotEq) => BinOp::NotEq,
      Some(Token::Lt) => BinOp::Lt,
      Some(Token::Le) => BinOp::Le,
      Some(Token::Gt) => BinOp::Gt,
      Some(Token::Ge) => BinOp::Ge,
      Some(Token::Ident(w)) => match w.as_str() {
        "contains" => BinOp::Contains,
        "matches" => BinOp::Matches,
        "startsWith" => BinOp::StartsWith,
        "endsWith" => BinOp::EndsWith,
        "in" => BinOp::In,
        _ => return Ok((left, left_depth)),
      },
      _ => return Ok((left, left_depth)),
    };
    self.pos += 1;
    let (right, right_depth) = self.sum()?;
    let depth = self.node(left_depth.max(right_depth))?;
    Ok((Expr::Binary(op, Box::new(left), Box::new(right)), depth))
  }

  fn sum(&mut self) -> Result<Parsed, ScriptError> {
    let (mut left, mut depth) = self.product()?;
    loop {
      let op = match self.peek() {
        Some(Token::Plus) => BinOp::Add,
        Some(Token::Minus) => BinOp::Sub,
        _ => return Ok((left, depth)),
      };
      self.pos += 1;
      let (right, right_depth) = self.product()?;
      depth = self.node(depth.max(right_depth))?;
      left = Expr::Binary(op, Box::new(left), Box::new(right));
    }
  }

  fn product(&mut self) -> Result<Parsed, ScriptError> {
    let (mut left, mut depth) = self.unary()?;
    loop {
      let op = match self.peek() {
        Some(Token::Star) => BinOp::Mul,
        Some(Token::Slash) => BinOp::Div,
        _ => return Ok((left, depth)),
      };
      self.pos += 1;
      let (right, right_depth) = self.unary()?;
      depth = self.node(depth.max(right_depth))?;
      left = Expr::Binary(op, Box::new(left), Box::new(right));
    }
  }

  fn unary(&mut self) -> Result<Parsed, ScriptError> {
    let op = if self.eat(&Token::Bang) {
      UnOp::Not
    } else if self.eat(&Token::Minus) {
      UnOp::Neg
    } else {
      return self.postfix();
    };
    self.descend()?;
    let operand = self.unary();
    self.nesting -= 1;
    let (operand, depth) = operand?;
    Ok((Expr::Unary(op, Box::new(operand)), self.node(depth)?))
  }

  fn postfix(&mut self) -> Result<Parsed, ScriptError> {
    let (mut expr, mut depth) = self.primary()?;
    loop {
      if self.eat(&Token::Dot) {
        let Some(Token::Ident(field)) = self.next() else {
          return Err(self.error("expected a field name after '.'"));
        };
        depth = self.node(depth)?;
        expr = Expr::Member(Box::new(expr), field);
      } else if self.eat(&Token::LBracket) {
        let (index, index_depth) = self.nested()?;
        self.expect(Token::RBracket)?;
        depth = self.node(depth.max(index_depth))?;
        expr = Expr::Index(Box::new(expr), Box::new(index));
      } else {
        return Ok((expr, depth));
      }
    }
  }

  /// Comma separated expressions up to `close`, with their deepest depth
  fn args(&mut self, close: Token) -> Result<(Vec<Expr>, usize), ScriptError> {
    let mut args = Vec::new();
    let mut depth = 0;
    if self.eat(&close) {
      return Ok((args, depth));
    }
    loop {
      let (arg, arg_depth) = self.nested()?;
      args.push(arg);
      depth = depth.max(arg_depth);
      if self.eat(&close) {
        return Ok((args, depth));
      }
      self.expect(Token::Comma)?;
    }
  }

  fn primary(&mut self) -> Result<Parsed, ScriptError> {
    match self.next() {
      Some(Token::Num(n)) => Ok((Expr::Literal(super::eval::number(n)), 1)),
      Some(Token::Str(s)) => Ok((Expr::Literal(Value::String(s)), 1)),
      Some(Token::Ident(word)) => match word.as_str() {
        "true" => Ok((Expr::Literal(Value::Bool(true)), 1)),
        "false" => Ok((Expr::Literal(Value::Bool(false)), 1)),
        "null" | "undefined" => Ok((Expr::Literal(Value::Null), 1)),
        _ if self.eat(&Token::LParen) => {
          let (args, depth) = self.args(Token::RParen)?;
          Ok((Expr::Call(word, args), self.node(depth)?))
        }
        _ => Ok((Expr::Var(word), 1)),
      },
      Some(Token::LParen) => {
        let inner = self.nested()?;
        self.expect(Token::RParen)?;
        Ok(inner)
      }
      Some(Token::LBracket) => {
        let (items, depth) = self.args(Token::RBracket)?;
        Ok((Expr::List(items), self.node(depth)?))
      }
      Some(Token::LBrace) => {
        let mut pairs = Vec::new();
        let mut depth = 0;
        if self.eat(&Token::RBrace) {
          return Ok((Expr::Object(pairs), 1));
        }
        loop {
          let key = match self.next() {
            Some(Token::Str(k)) | Some(Token::Ident(k)) => k,
            _ => return Err(self.error("expected an object key")),
          };
          self.expect(Token::Colon)?;
          let (value, value_depth) = self.nested()?;
          pairs.push((key, value));
          depth = depth.max(value_depth);
          if self.eat(&Token::RBrace) {
            return Ok((Expr::Object(pairs), self.node(depth)?));
          }
          self.expect(Token::Comma)?;
        }
      }
      Some(other) => Err(self.error(format!("unexpected {:?}", other))),
      None => Err(self.error("unexpected end of line")),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn parses_statements_and_precedence() {
    let script = "# header\nlet body = json(response.body)\n\ntest \"ok\": response.status == 200 && body.items[0].id > 1 + 2 * 3\nassert len(body.items) > 0, \"has items\"\nprint \"count\", len(body.items)";
    let statements = parse(script).unwrap();
    assert_eq!(statements.len(), 4);
    assert_eq!(statements[0].line, 2);
    let StmtKind::Test(name, Expr::And(_, right)) = &statements[1].kind else {
      panic!("expected test with &&");
    };
    assert_eq!(name, "ok");
    let Expr::Binary(BinOp::Gt, _, sum) = right.as_ref() else {
      panic!("expected >");
    };
    assert!(matches!(sum.as_ref(), Expr::Binary(BinOp::Add, _, _)));
    assert!(matches!(&statements[2].kind, StmtKind::Assert(_, Some(_))));
    assert!(matches!(&statements[3].kind, StmtKind::Print(args) if args.len() == 2));
  }

  #[test]
  fn syntax_errors_carry_line_numbers() {
    let err = parse("test \"a\": 1 == 1\ntest missing colon 1").unwrap_err();
    assert_eq!(err.line, 2);
    assert!(parse("let response = 1").is_err());
    assert!(parse("assert (1 == 1").is_err());
    assert!(parse("explode 1").is_err());
  }

  #[test]
  fn word_operators() {
    let statements = parse("test \"t\": response.headers[\"content-type\"] contains \"json\"").unwrap();
    let StmtKind::Test(_, Expr::Binary(op, _, _)) = &statements[0].kind else {
      panic!("expected binary");
    };
    assert_eq!(*op, BinOp::Contains);
  }

  #[test]
  fn nesting_is_bounded() {
    let shallow = format!("test \"t\": {}1{} == 1", "(".repeat(100), ")".repeat(100));
    assert!(parse(&shallow).is_ok());

    let parens = format!("test \"t\": {}1{}", "(".repeat(100_000), ")".repeat(100_000));
    let negations = format!("test \"t\": {}true", "!".repeat(100_000));
    let chain = format!("let x = 1{}", " + 1".repeat(100_000));
    let lists = format!("let x = {}1{}", "[".repeat(100_000), "]".repeat(100_000));
    for script in [parens, negations, chain, lists] {
      let err = parse(&script).unwrap_err();
      assert!(err.message.contains("deeper than"), "{}", err);
    }
  }
}
