//! Tokenizer for test scripts. Scripts are line oriented, so each line is
//! tokenized on its own and `#` starts a comment outside string literals.

use super::ScriptError;

#[derive(Debug, Clone, PartialEq)]
pub enum Token {
  Ident(String),
  Str(String),
  Num(f64),
  LParen,
  RParen,
  LBracket,
  RBracket,
  LBrace,
  RBrace,
  Comma,
  Dot,
  Colon,
  Assign,
  EqEq,
  NotEq,
  Lt,
  Le,
  Gt,
  Ge,
  Plus,
  Minus,
  Star,
  Slash,
  AndAnd,
  OrOr,
  Bang,
}

/// Tokens of one line; empty for blank and comment-only lines
pub fn tokenize(line: &str, line_no: usize) -> Result<Vec<Token>, ScriptError> {
  let err = |msg: String| ScriptError::syntax(line_no, msg);
  let chars: Vec<char> = line.chars().collect();
  let mut tokens = Vec::new();
  let mut i = 0;
  while i < chars.len() {
    let c = chars[i];
    match c {
      c if c.is_whitespace() => i += 1,
      '#' => break,
      '"' | '\'' => {
        let quote = c;
        let mut value = String::new();
        i += 1;
        loop {
          let Some(&c) = chars.get(i) else {
            return Err(err("unterminated string".to_string()));
          };
          i += 1;
          match c {
            c if c == quote => break,
            '\\' => {
              let escaped = chars
                .get(i)
                .copied()
                .ok_or_else(|| err("unterminated string".to_string()))?;
              i += 1;
              value.push(match escaped {
                'n' => '\n',
                't' => '\t',
                'r' => '\r',
                '0' => '\0',
                other => other,
              });
            }
            c => value.push(c),
          }
        }
        tokens.push(Token::Str(value));
      }
      c if c.is_ascii_digit() => {
        let start = i;
        while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.' || chars[i] == '_') {
          // `1.foo` is not a number followed by a member
          if chars[i] == '.' && !chars.get(i + 1).is_some_and(|n| n.is_ascii_digit()) {
            break;
          }
          i += 1;
        }
        let text: String = chars[start..i].iter().filter(|c| **c != '_').collect();
        let number = text
          .parse::<f64>()
          .map_err(|_| err(format!("invalid number {}", text)))?;
        tokens.push(Token::Num(number));
      }
      c if c.is_alphabetic() || c == '_' || c == '$' => {
        let start = i;
        while i < chars.len() && (chars[i].is_alphanumeric() || chars[i] == '_' || chars[i] == '$') {
          i += 1;
        }
        tokens.push(Token::Ident(chars[start..i].iter().collect()));
      }
      _ => {
        let next = chars.get(i + 1).copied();
        let (token, width) = match (c, next) {
          ('=', Some('=')) => (Token::EqEq, 2),
          ('!', Some('=')) => (Token::NotEq, 2),
          ('<', Some('=')) => (Token::Le, 2),
          ('>', Some('=')) => (Token::Ge, 2),
          ('&', Some('&')) => (Token::AndAnd, 2),
          ('|', Some('|')) => (Token::OrOr, 2),
          ('=', _) => (Token::Assign, 1),
          ('!', _) => (Token::Bang, 1),
          ('<', _) => (Token::Lt, 1),
          ('>', _) => (Token::Gt, 1),
          ('(', _) => (Token::LParen, 1),
          (')', _) => (Token::RParen, 1),
          ('[', _) => (Token::LBracket, 1),
          (']', _) => (Token::RBracket, 1),
          ('{', _) => (Token::LBrace, 1),
          ('}', _) => (Token::RBrace, 1),
          (',', _) => (Token::Comma, 1),
          ('.', _) => (Token::Dot, 1),
          (':', _) => (Token::Colon, 1),
          ('+', _) => (Token::Plus, 1),
          ('-', _) => (Token::Minus, 1),
          ('*', _) => (Token::Star, 1),
          ('/', _) => (Token::Slash, 1),
          _ => return Err(err(format!("unexpected character {:?}", c))),
        };
        // `===` and `!==` read the same as their two-character forms
        let width = if matches!(token, Token::EqEq | Token::NotEq) && chars.get(i + 2) == Some(&'=') {
          3
        } else {
          width
        };
        tokens.push(token);
        i += width;
      }
    }
  }
  Ok(tokens)
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn tokenizes_statement_with_comment() {
    let tokens = tokenize(r#"test "ok": response.status == 200 # trailing"#, 1).unwrap();
    assert_eq!(
      tokens,
      vec![
        Token::Ident("test".into()),
        Token::Str("ok".into()),
        Token::Colon,
        Token::Ident("response".into()),
        Token::Dot,
        Token::Ident("status".into()),
        Token::EqEq,
        Token::Num(200.0),
      ]
    );
  }

  #[test]
  fn strings_keep_hash_and_escapes() {
    let tokens = tokenize(r#"print 'a # b', "q\"x\n""#, 1).unwrap();
    assert_eq!(tokens[1], Token::Str("a # b".into()));
    assert_eq!(tokens[3], Token::Str("q\"x\n".into()));
  }

  #[test]
  fn reports_line_of_bad_input() {
    let err = tokenize("let x = @", 7).unwrap_err();
    assert_eq!(err.line, 7);
    assert!(tokenize("let s = \"open", 1).is_err());
    assert_eq!(tokenize("a === 1.5", 1).unwrap()[1], Token::EqEq);
  }
}
