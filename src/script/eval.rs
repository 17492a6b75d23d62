//! Evaluation of parsed scripts over read-only JSON views of an exchange

use super::parser::{BinOp, Expr, Stmt, StmtKind, UnOp};
use regex::RegexBuilder;
use serde_json::{Map, Value};
use std::collections::HashMap;

/// Upper bound on evaluated expression nodes per script
pub const MAX_STEPS: usize = 100_000;
/// Compiled size limit for `matches` patterns
const REGEX_SIZE_LIMIT: usize = 1 << 20;

/// Outcome of one `test` or `assert`
#[derive(Debug, Clone, PartialEq)]
pub struct Assertion {
  pub name: String,
  pub passed: bool,
  pub message: Option<String>,
}

/// Everything one script run produced
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ScriptOutput {
  pub assertions: Vec<Assertion>,
  pub prints: Vec<String>,
  /// Set when the run stopped early
  pub error: Option<String>,
}

pub struct Interpreter {
  vars: HashMap<String, Value>,
  steps: usize,
  max_steps: usize,
}

impl Interpreter {
  /// `request`, `response` and `rule` are bound read-only
  pub fn new(request: Value, response: Value, rule: Value) -> Self {
    let mut vars = HashMap::new();
    vars.insert("request".to_string(), request);
    vars.insert("response".to_string(), response);
    vars.insert("rule".to_string(), rule);
    Self {
      vars,
      steps: 0,
      max_steps: MAX_STEPS,
    }
  }

  pub fn with_max_steps(mut self, max_steps: usize) -> Self {
    self.max_steps = max_steps;
    self
  }

  /// Run every statement. A failing `test`/`assert` expression only fails that
  /// assertion; errors in `let` or `print` stop the run.
  pub fn run(mut self, statements: &[Stmt]) -> ScriptOutput {
    let mut output = ScriptOutput::default();
    for stmt in statements {
      match &stmt.kind {
        StmtKind::Let(name, expr) => match self.eval(expr) {
          Ok(value) => {
            self.vars.insert(name.clone(), value);
          }
          Err(e) => {
            output.error = Some(format!("line {}: {}", stmt.line, e));
            return output;
          }
        },
        StmtKind::Test(name, expr) => {
          output.assertions.push(self.check(name.clone(), expr, stmt.line));
        }
        StmtKind::Assert(expr, message) => {
          let name = match message {
            Some(m) => match self.eval(m) {
              Ok(v) => display(&v),
              Err(_) => format!("assert at line {}", stmt.line),
            },
            None => format!("assert at line {}", stmt.line),
          };
          output.assertions.push(self.check(name, expr, stmt.line));
        }
        StmtKind::Print(args) => {
          let mut parts = Vec::with_capacity(args.len());
          for arg in args {
            match self.eval(arg) {
              Ok(v) => parts.push(display(&v)),
              Err(e) => {
                output.error = Some(format!("line {}: {}", stmt.line, e));
                return output;
              }
            }
          }
          output.prints.push(parts.join(" "));
        }
      }
      if self.steps > self.max_steps {
        output.error = Some("script exceeded its step budget".to_string());
        return output;
      }
    }
    output
  }

  fn check(&mut self, name: String, expr: &Expr, line: usize) -> Assertion {
    match self.eval(expr) {
      Ok(v) if truthy(&v) => Assertion {
        name,
        passed: true,
        message: None,
      },
      Ok(v) => Assertion {
        name,
        passed: false,
        message: Some(format!("line {}: evaluated to {}", line, display(&v))),
      },
      Err(e) => Assertion {
        name,
        passed: false,
        message: Some(format!("line {}: {}", line, e)),
      },
    }
  }

  fn eval(&mut self, expr: &Expr) -> Result<Value, String> {
    self.steps += 1;
    if self.steps > self.max_steps {
      return Err("step budget exceeded".to_string());
    }
    match expr {
      Expr::Literal(v) => Ok(v.clone()),
      Expr::Var(name) => self
        .vars
        .get(name)
        .cloned()
        .ok_or_else(|| format!("{} is not defined", name)),
      Expr::Member(target, field) => {
        let target = self.eval(target)?;
        Ok(member(&target, field))
      }
      Expr::Index(target, index) => {
        let target = self.eval(target)?;
        let index = self.eval(index)?;
        Ok(index_value(&target, &index))
      }
      Expr::List(items) => {
        let mut values = Vec::with_capacity(items.len());
        for item in items {
          values.push(self.eval(item)?);
        }
        Ok(Value::Array(values))
      }
      Expr::Object(pairs) => {
        let mut map = Map::new();
        for (key, value) in pairs {
          let value = self.eval(value)?;
          map.insert(key.clone(), value);
        }
        Ok(Value::Object(map))
      }
      Expr::Call(name, args) => {
        let mut values = Vec::with_capacity(args.len());
        for arg in args {
          values.push(self.eval(arg)?);
        }
        call(name, &values)
      }
      Expr::Unary(UnOp::Not, inner) => Ok(Value::Bool(!truthy(&self.eval(inner)?))),
      Expr::Unary(UnOp::Neg, inner) => match as_number(&self.eval(inner)?) {
        Some(n) => Ok(number(-n)),
        None => Err("cannot negate a non-number".to_string()),
      },
      Expr::And(left, right) => {
        let left = self.eval(left)?;
        if !truthy(&left) {
          return Ok(left);
        }
        self.eval(right)
      }
      Expr::Or(left, right) => {
        let left = self.eval(left)?;
        if truthy(&left) {
          return Ok(left);
        }
        self.eval(right)
      }
      Expr::Binary(op, left, right) => {
        let left = self.eval(left)?;
        let right = self.eval(right)?;
        binary(*op, &left, &right)
      }
    }
  }
}

/// JSON number, integral when it fits
pub(crate) fn number(n: f64) -> Value {
  if n.fract() == 0.0 && n.abs() < 9_007_199_254_740_992.0 {
    Value::from(n as i64)
  } else {
    serde_json::Number::from_f64(n).map(Value::Number).unwrap_or(Value::Null)
  }
}

fn as_number(v: &Value) -> Option<f64> {
  match v {
    Value::Number(n) => n.as_f64(),
    _ => None,
  }
}

/// Numbers, plus strings that read as numbers
fn coerce_number(v: &Value) -> Option<f64> {
  match v {
    Value::Number(n) => n.as_f64(),
    Value::String(s) => s.trim().parse().ok(),
    Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
    _ => None,
  }
}

pub(crate) fn truthy(v: &Value) -> bool {
  match v {
    Value::Null => false,
    Value::Bool(b) => *b,
    Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0 && !f.is_nan()),
    Value::String(s) => !s.is_empty(),
    Value::Array(_) | Value::Object(_) => true,
  }
}

pub(crate) fn display(v: &Value) -> String {
  match v {
    Value::String(s) => s.clone(),
    Value::Null => "null".to_string(),
    other => other.to_string(),
  }
}

fn type_name(v: &Value) -> &'static str {
  match v {
    Value::Null => "null",
    Value::Bool(_) => "boolean",
    Value::Number(_) => "number",
    Value::String(_) => "string",
    Value::Array(_) => "array",
    Value::Object(_) => "object",
  }
}

fn loose_eq(a: &Value, b: &Value) -> bool {
  match (a, b) {
    (Value::Number(_), Value::String(_)) | (Value::String(_), Value::Number(_)) => {
      match (coerce_number(a), coerce_number(b)) {
        (Some(x), Some(y)) => x == y,
        _ => false,
      }
    }
    (Value::Number(x), Value::Number(y)) => x.as_f64() == y.as_f64(),
    _ => a == b,
  }
}

fn member(target: &Value, field: &str) -> Value {
  match (target, field) {
    (Value::Object(map), _) => lookup(map, field),
    (Value::String(s), "length") => Value::from(s.chars().count()),
    (Value::Array(a), "length") => Value::from(a.len()),
    _ => Value::Null,
  }
}

/// Exact key, then a case-insensitive match (header maps)
fn lookup(map: &Map<String, Value>, key: &str) -> Value {
  if let Some(v) = map.get(key) {
    return v.clone();
  }
  map
    .iter()
    .find(|(k, _)| k.eq_ignore_ascii_case(key))
    .map(|(_, v)| v.clone())
    .unwrap_or(Value::Null)
}

fn index_value(target: &Value, index: &Value) -> Value {
  match (target, index) {
    (Value::Object(map), Value::String(key)) => lookup(map, key),
    (Value::Array(items), Value::Number(n)) => n
      .as_i64()
      .and_then(|i| {
        let i = if i < 0 { items.len() as i64 + i } else { i };
        usize::try_from(i).ok()
      })
      .and_then(|i| items.get(i).cloned())
      .unwrap_or(Value::Null),
    (Value::String(s), Value::Number(n)) => n
      .as_u64()
      .and_then(|i| s.chars().nth(i as usize))
      .map(|c| Value::String(c.to_string()))
      .unwrap_or(Value::Null),
    (target, Value::String(key)) => member(target, key),
    _ => Value::Null,
  }
}

fn contains(haystack: &Value, needle: &Value) -> Result<bool, String> {
  match (haystack, needle) {
    (Value::String(h), n) => Ok(h.contains(display(n).as_str())),
    (Value::Array(items), n) => Ok(items.iter().any(|item| loose_eq(item, n))),
    (Value::Object(map), Value::String(key)) => Ok(!lookup(map, key).is_null()),
    (Value::Null, _) => Ok(false),
    (h, _) => Err(format!("cannot search inside a {}", type_name(h))),
  }
}

fn compare(op: BinOp, a: &Value, b: &Value) -> Result<bool, String> {
  let ordering = match (a, b) {
    (Value::String(x), Value::String(y)) => x.cmp(y),
    _ => match (coerce_number(a), coerce_number(b)) {
      (Some(x), Some(y)) => x
        .partial_cmp(&y)
        .ok_or_else(|| "cannot compare NaN".to_string())?,
      _ => {
        return Err(format!(
          "cannot compare {} with {}",
          type_name(a),
          type_name(b)
        ))
      }
    },
  };
  Ok(match op {
    BinOp::Lt => ordering.is_lt(),
    BinOp::Le => ordering.is_le(),
    BinOp::Gt => ordering.is_gt(),
    _ => ordering.is_ge(),
  })
}

fn arithmetic(op: BinOp, a: &Value, b: &Value) -> Result<Value, String> {
  if op == BinOp::Add {
    match (a, b) {
      (Value::String(_), _) | (_, Value::String(_)) => {
        return Ok(Value::String(display(a) + &display(b)));
      }
      (Value::Array(x), Value::Array(y)) => {
        return Ok(Value::Array(x.iter().chain(y.iter()).cloned().collect()));
      }
      _ => {}
    }
  }
  let (Some(x), Some(y)) = (as_number(a), as_number(b)) else {
    return Err(format!(
      "arithmetic needs numbers, got {} and {}",
      type_name(a),
      type_name(b)
    ));
  };
  match op {
    BinOp::Add => Ok(number(x + y)),
    BinOp::Sub => Ok(number(x - y)),
    BinOp::Mul => Ok(number(x * y)),
    _ if y == 0.0 => Err("division by zero".to_string()),
    _ => Ok(number(x / y)),
  }
}

fn binary(op: BinOp, a: &Value, b: &Value) -> Result<Value, String> {
  let result = match op {
    BinOp::Eq => loose_eq(a, b),
    BinOp::NotEq => !loose_eq(a, b),
    BinOp::Lt | BinOp::Le | BinOp::Gt | BinOp::Ge => compare(op, a, b)?,
    BinOp::Add | BinOp::Sub | BinOp::Mul | BinOp::Div => return arithmetic(op, a, b),
    BinOp::Contains => contains(a, b)?,
    BinOp::In => contains(b, a)?,
    BinOp::StartsWith => display(a).starts_with(display(b).as_str()),
    BinOp::EndsWith => display(a).ends_with(display(b).as_str()),
    BinOp::Matches => {
      let pattern = display(b);
      let re = RegexBuilder::new(&pattern)
        .size_limit(REGEX_SIZE_LIMIT)
        .build()
        .map_err(|e| format!("invalid pattern {:?}: {}", pattern, e))?;
      re.is_match(&display(a))
    }
  };
  Ok(Value::Bool(result))
}

fn call(name: &str, args: &[Value]) -> Result<Value, String> {
  let arg = |i: usize| args.get(i).unwrap_or(&Value::Null);
  let expect_args = |n: usize| {
    if args.len() == n {
      Ok(())
    } else {
      Err(format!("{}() takes {} argument(s), got {}", name, n, args.len()))
    }
  };
  match name {
    "len" => {
      expect_args(1)?;
      match arg(0) {
        Value::String(s) => Ok(Value::from(s.chars().count())),
        Value::Array(a) => Ok(Value::from(a.len())),
        Value::Object(o) => Ok(Value::from(o.len())),
        Value::Null => Ok(Value::from(0)),
        other => Err(format!("len() of a {}", type_name(other))),
      }
    }
    "lower" => {
      expect_args(1)?;
      Ok(Value::String(display(arg(0)).to_lowercase()))
    }
    "upper" => {
      expect_args(1)?;
      Ok(Value::String(display(arg(0)).to_uppercase()))
    }
    "trim" => {
      expect_args(1)?;
      Ok(Value::String(display(arg(0)).trim().to_string()))
    }
    "json" => {
      expect_args(1)?;
      match arg(0) {
        Value::String(s) => serde_json::from_str(s).map_err(|e| format!("json(): {}", e)),
        other => Ok(other.clone()),
      }
    }
    "exists" => {
      expect_args(1)?;
      Ok(Value::Bool(!arg(0).is_null()))
    }
    "type" => {
      expect_args(1)?;
      Ok(Value::String(type_name(arg(0)).to_string()))
    }
    "number" => {
      expect_args(1)?;
      coerce_number(arg(0))
        .map(number)
        .ok_or_else(|| format!("number(): {} is not numeric", display(arg(0))))
    }
    "string" => {
      expect_args(1)?;
      Ok(Value::String(display(arg(0))))
    }
    _ => Err(format!("unknown function {}()", name)),
  }
}
