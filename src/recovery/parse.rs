//! 动作串解析
//!
//! 语法：`Action(arg, key=value, ...)[.above('x')|.below('x')|.left('x')|.right('x')|.offset(x=1, y=2)]*.do()`，
//! 值支持单 / 双引号字符串、整数、浮点、True / False / None 与字符串列表。
//! 纠偏场景只允许 [`RECOVERY_ACTIONS`] 中的动作；`NoAction...` 表示无需操作。

use std::collections::VecDeque;

use thiserror::Error;

use crate::actions::{Keys, Relation, Target, UiAction, WindowOp};

/// 纠偏允许使用的动作
pub const RECOVERY_ACTIONS: &[&str] = &[
    "LeftClick",
    "DoubleClick",
    "SendKeys",
    "PressKeys",
    "ActivateWindow",
    "CloseWindow",
];

/// 解析结果
#[derive(Debug, Clone, PartialEq)]
pub enum CorrectiveAction {
    NoAction,
    Perform(UiAction),
}

/// 解析错误；其文本会作为反馈回传给纠偏 Agent
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ParseError {
    #[error("Invalid action string: empty action string")]
    Empty,

    #[error("Invalid action string at position {position}: unknown action '{name}'. Allowed actions: {}", RECOVERY_ACTIONS.join(", "))]
    UnknownAction { position: usize, name: String },

    #[error("Invalid action string at position {position}: unknown method '.{name}()'")]
    UnknownMethod { position: usize, name: String },

    #[error("Invalid action string at position {position}: {message}")]
    BadLiteral { position: usize, message: String },

    #[error("Invalid action string at position {position}: {message}")]
    UnexpectedToken { position: usize, message: String },

    #[error("Invalid action string at position {position}: {message}")]
    BadArgument { position: usize, message: String },

    #[error("Invalid action string: action string must end with '.do()'")]
    MissingDo,

    #[error("Invalid action string at position {position}: '.do()' must be the last call")]
    TrailingInput { position: usize },

    #[error("Invalid action string: missing action before '.do()'")]
    MissingAction,

    #[error("Invalid action string: {0}")]
    InvalidAction(String),
}

impl ParseError {
    /// 出错位置（字符偏移）
    pub fn position(&self) -> Option<usize> {
        match self {
            ParseError::UnknownAction { position, .. }
            | ParseError::UnknownMethod { position, .. }
            | ParseError::BadLiteral { position, .. }
            | ParseError::UnexpectedToken { position, .. }
            | ParseError::BadArgument { position, .. }
            | ParseError::TrailingInput { position } => Some(*position),
            _ => None,
        }
    }

    fn literal(position: usize, message: impl Into<String>) -> Self {
        ParseError::BadLiteral {
            position,
            message: message.into(),
        }
    }

    fn token(position: usize, message: impl Into<String>) -> Self {
        ParseError::UnexpectedToken {
            position,
            message: message.into(),
        }
    }

    fn argument(position: usize, message: impl Into<String>) -> Self {
        ParseError::BadArgument {
            position,
            message: message.into(),
        }
    }
}

/// 解析纠偏动作串
pub fn parse_action_string(input: &str) -> Result<CorrectiveAction, ParseError> {
    let input = input.trim();
    if input.starts_with("NoAction") {
        return Ok(CorrectiveAction::NoAction);
    }
    if input.is_empty() {
        return Err(ParseError::Empty);
    }
    let tokens = tokenize(input)?;
    let calls = Parser { tokens, pos: 0 }.chain()?;
    build(calls).map(CorrectiveAction::Perform)
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Ident(String),
    Str(String),
    Int(i64),
    Float(f64),
    LParen,
    RParen,
    LBracket,
    RBracket,
    Comma,
    Dot,
    Eq,
}

fn tokenize(input: &str) -> Result<Vec<(usize, Token)>, ParseError> {
    let chars: Vec<char> = input.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        let start = i;
        let single = match c {
            '(' => Some(Token::LParen),
            ')' => Some(Token::RParen),
            '[' => Some(Token::LBracket),
            ']' => Some(Token::RBracket),
            ',' => Some(Token::Comma),
            '.' => Some(Token::Dot),
            '=' => Some(Token::Eq),
            _ => None,
        };
        if let Some(token) = single {
            tokens.push((start, token));
            i += 1;
            continue;
        }

        if c.is_whitespace() {
            i += 1;
        } else if c == '\'' || c == '"' {
            let quote = c;
            let mut value = String::new();
            i += 1;
            loop {
                let Some(&ch) = chars.get(i) else {
                    return Err(ParseError::literal(start, "unterminated string"));
                };
                i += 1;
                match ch {
                    '\\' => {
                        let escaped = chars
                            .get(i)
                            .ok_or_else(|| ParseError::literal(start, "unterminated string"))?;
                        value.push(match escaped {
                            'n' => '\n',
                            't' => '\t',
                            other => *other,
                        });
                        i += 1;
                    }
                    ch if ch == quote => break,
                    ch => value.push(ch),
                }
            }
            tokens.push((start, Token::Str(value)));
        } else if c.is_ascii_digit()
            || (c == '-' && chars.get(i + 1).is_some_and(|n| n.is_ascii_digit()))
        {
            i += 1;
            while chars.get(i).is_some_and(|n| n.is_ascii_digit()) {
                i += 1;
            }
            let is_float = chars.get(i) == Some(&'.')
                && chars.get(i + 1).is_some_and(|n| n.is_ascii_digit());
            if is_float {
                i += 1;
                while chars.get(i).is_some_and(|n| n.is_ascii_digit()) {
                    i += 1;
                }
            }
            let text: String = chars[start..i].iter().collect();
            let token = if is_float {
                text.parse().map(Token::Float).ok()
            } else {
                text.parse().map(Token::Int).ok()
            };
            tokens.push((
                start,
                token.ok_or_else(|| ParseError::literal(start, format!("invalid number '{text}'")))?,
            ));
        } else if c.is_alphabetic() || c == '_' {
            while chars.get(i).is_some_and(|n| n.is_alphanumeric() || *n == '_') {
                i += 1;
            }
            tokens.push((start, Token::Ident(chars[start..i].iter().collect())));
        } else {
            return Err(ParseError::token(start, format!("unexpected character '{c}'")));
        }
    }
    Ok(tokens)
}

#[derive(Debug, Clone, PartialEq)]
enum Literal {
    Str(String),
    Int(i64),
    Float(f64),
    Bool(bool),
    None,
    List(Vec<Literal>),
}

impl Literal {
    fn type_name(&self) -> &'static str {
        match self {
            Literal::Str(_) => "string",
            Literal::Int(_) => "integer",
            Literal::Float(_) => "float",
            Literal::Bool(_) => "boolean",
            Literal::None => "None",
            Literal::List(_) => "list",
        }
    }
}

#[derive(Debug)]
struct Call {
    name: String,
    position: usize,
    positional: VecDeque<Literal>,
    keyword: Vec<(String, Literal)>,
}

struct Parser {
    tokens: Vec<(usize, Token)>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos).map(|(_, t)| t)
    }

    fn offset(&self) -> usize {
        self.tokens
            .get(self.pos)
            .map(|(p, _)| *p)
            .or_else(|| self.tokens.last().map(|(p, _)| *p + 1))
            .unwrap_or(0)
    }

    fn next(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).map(|(_, t)| t.clone());
        self.pos += 1;
        token
    }

    fn expect(&mut self, expected: Token, what: &str) -> Result<(), ParseError> {
        let offset = self.offset();
        match self.next() {
            Some(token) if token == expected => Ok(()),
            Some(_) => Err(ParseError::token(offset, format!("expected {what}"))),
            None => Err(ParseError::token(offset, format!("expected {what}, found end of input"))),
        }
    }

    fn chain(mut self) -> Result<Vec<Call>, ParseError> {
        let mut calls = vec![self.call()?];
        while self.peek().is_some() {
            self.expect(Token::Dot, "'.'")?;
            calls.push(self.call()?);
        }
        Ok(calls)
    }

    fn call(&mut self) -> Result<Call, ParseError> {
        let position = self.offset();
        let name = match self.next() {
            Some(Token::Ident(name)) => name,
            _ => return Err(ParseError::token(position, "expected an action or method name")),
        };
        self.expect(Token::LParen, "'('")?;

        let mut call = Call {
            name,
            position,
            positional: VecDeque::new(),
            keyword: Vec::new(),
        };
        loop {
            if self.peek() == Some(&Token::RParen) {
                self.pos += 1;
                break;
            }
            let keyword = match (self.tokens.get(self.pos), self.tokens.get(self.pos + 1)) {
                (Some((_, Token::Ident(key))), Some((_, Token::Eq))) => Some(key.clone()),
                _ => None,
            };
            if let Some(key) = keyword {
                self.pos += 2;
                let value = self.literal()?;
                call.keyword.push((key, value));
            } else {
                if !call.keyword.is_empty() {
                    return Err(ParseError::argument(
                        self.offset(),
                        "positional argument follows keyword argument",
                    ));
                }
                let value = self.literal()?;
                call.positional.push_back(value);
            }
            match self.peek() {
                Some(Token::Comma) => self.pos += 1,
                Some(Token::RParen) => {}
                _ => return Err(ParseError::token(self.offset(), "expected ',' or ')'")),
            }
        }
        Ok(call)
    }

    fn literal(&mut self) -> Result<Literal, ParseError> {
        let offset = self.offset();
        match self.next() {
            Some(Token::Str(s)) => Ok(Literal::Str(s)),
            Some(Token::Int(n)) => Ok(Literal::Int(n)),
            Some(Token::Float(f)) => Ok(Literal::Float(f)),
            Some(Token::Ident(word)) => match word.as_str() {
                "True" | "true" => Ok(Literal::Bool(true)),
                "False" | "false" => Ok(Literal::Bool(false)),
                "None" | "null" => Ok(Literal::None),
                _ => Err(ParseError::literal(offset, format!("unknown name '{word}'"))),
            },
            Some(Token::LBracket) => {
                let mut items = Vec::new();
                loop {
                    if self.peek() == Some(&Token::RBracket) {
                        self.pos += 1;
                        break;
                    }
                    items.push(self.literal()?);
                    match self.peek() {
                        Some(Token::Comma) => self.pos += 1,
                        Some(Token::RBracket) => {}
                        _ => return Err(ParseError::token(self.offset(), "expected ',' or ']'")),
                    }
                }
                Ok(Literal::List(items))
            }
            _ => Err(ParseError::literal(offset, "expected a value")),
        }
    }
}

impl Call {
    /// 必填参数：关键字优先，否则取下一个位置参数
    fn required(&mut self, key: &str) -> Result<Literal, ParseError> {
        self.optional(key)
            .or_else(|| self.positional.pop_front())
            .ok_or_else(|| {
                ParseError::argument(
                    self.position,
                    format!("{} is missing required argument '{}'", self.name, key),
                )
            })
    }

    fn optional(&mut self, key: &str) -> Option<Literal> {
        let idx = self.keyword.iter().position(|(k, _)| k == key)?;
        Some(self.keyword.remove(idx).1)
    }

    fn required_str(&mut self, key: &str) -> Result<String, ParseError> {
        let value = self.required(key)?;
        self.expect_str(key, value)
    }

    fn optional_str(&mut self, key: &str) -> Result<Option<String>, ParseError> {
        match self.optional(key) {
            None | Some(Literal::None) => Ok(None),
            Some(value) => self.expect_str(key, value).map(Some),
        }
    }

    fn optional_int(&mut self, key: &str) -> Result<Option<i64>, ParseError> {
        let value = self.optional(key).or_else(|| self.positional.pop_front());
        match value {
            None => Ok(None),
            Some(Literal::Int(n)) => Ok(Some(n)),
            Some(other) => Err(self.type_error(key, "integer", &other)),
        }
    }

    fn expect_str(&self, key: &str, value: Literal) -> Result<String, ParseError> {
        match value {
            Literal::Str(s) => Ok(s),
            other => Err(self.type_error(key, "string", &other)),
        }
    }

    fn type_error(&self, key: &str, expected: &str, got: &Literal) -> ParseError {
        ParseError::argument(
            self.position,
            format!(
                "argument '{}' of {} must be a {}, got {}",
                key,
                self.name,
                expected,
                got.type_name()
            ),
        )
    }

    /// 所有参数都必须被消费
    fn finish(self) -> Result<(), ParseError> {
        if let Some((key, _)) = self.keyword.first() {
            return Err(ParseError::argument(
                self.position,
                format!("{} got an unexpected argument '{}'", self.name, key),
            ));
        }
        if !self.positional.is_empty() {
            return Err(ParseError::argument(
                self.position,
                format!("{} got too many positional arguments", self.name),
            ));
        }
        Ok(())
    }
}

fn relation(value: &str) -> Option<Relation> {
    match value {
        "above" => Some(Relation::Above),
        "below" => Some(Relation::Below),
        "left" => Some(Relation::Left),
        "right" => Some(Relation::Right),
        _ => None,
    }
}

/// 目标参数；兼容 `anchor='x', relation='above'` 的旧写法
fn target_of(call: &mut Call) -> Result<Target, ParseError> {
    let mut target = Target::text(call.required_str("target")?);
    legacy_anchor(call, &mut target)?;
    Ok(target)
}

fn legacy_anchor(call: &mut Call, target: &mut Target) -> Result<(), ParseError> {
    let anchor = call.optional_str("anchor")?;
    let rel = call.optional_str("relation")?;
    if let (Some(anchor), Some(rel)) = (anchor, rel) {
        if let Some(rel) = relation(&rel).filter(|_| !anchor.is_empty() && anchor != "None") {
            target.anchors.push(crate::actions::Anchor {
                value: anchor,
                relation: rel,
            });
        }
    }
    Ok(())
}

fn keys_of(call: &mut Call) -> Result<Keys, ParseError> {
    match call.required("keys")? {
        Literal::Str(s) => Ok(Keys::Text(s)),
        Literal::List(items) => items
            .into_iter()
            .map(|item| match item {
                Literal::Str(s) => Ok(s),
                other => Err(call.type_error("keys", "list of strings", &other)),
            })
            .collect::<Result<Vec<_>, _>>()
            .map(Keys::Sequence),
        other => Err(call.type_error("keys", "string or list of strings", &other)),
    }
}

fn construct(mut call: Call) -> Result<UiAction, ParseError> {
    // 由动作自身决定，模型偶尔会带上
    call.optional("action_type");

    let action = match call.name.as_str() {
        "LeftClick" => UiAction::LeftClick(target_of(&mut call)?),
        "DoubleClick" => UiAction::DoubleClick(target_of(&mut call)?),
        "SendKeys" => {
            let keys = keys_of(&mut call)?;
            let mut target = call.optional_str("target")?.map(Target::text);
            if let Some(t) = target.as_mut() {
                legacy_anchor(&mut call, t)?;
            } else {
                call.optional("anchor");
                call.optional("relation");
            }
            let key_separator = call.optional_str("key_separator")?;
            let followed_by = call.optional_str("followed_by")?;
            let interval = match call.optional("interval") {
                None => 0.05,
                Some(Literal::Float(f)) => f,
                Some(Literal::Int(n)) => n as f64,
                Some(other) => return Err(call.type_error("interval", "number", &other)),
            };
            UiAction::SendKeys {
                keys,
                target,
                key_separator,
                followed_by,
                interval,
            }
        }
        "PressKeys" => {
            call.optional("target");
            call.optional("anchor");
            call.optional("relation");
            UiAction::PressKeys(call.required_str("keys")?)
        }
        "ActivateWindow" => UiAction::window(WindowOp::Activate, call.required_str("window_name")?),
        "CloseWindow" => UiAction::window(WindowOp::Close, call.required_str("window_name")?),
        other => {
            return Err(ParseError::UnknownAction {
                position: call.position,
                name: other.to_string(),
            })
        }
    };
    call.finish()?;
    action.validate().map_err(|e| ParseError::InvalidAction(e.to_string()))?;
    Ok(action)
}

fn target_mut(action: &mut UiAction) -> Option<&mut Target> {
    match action {
        UiAction::LeftClick(t)
        | UiAction::RightClick(t)
        | UiAction::MiddleClick(t)
        | UiAction::DoubleClick(t)
        | UiAction::GetText(t) => Some(t),
        UiAction::SendKeys { target, .. } | UiAction::PasteText { target, .. } => target.as_mut(),
        _ => None,
    }
}

fn build(calls: Vec<Call>) -> Result<UiAction, ParseError> {
    let mut calls = VecDeque::from(calls);
    match calls.iter().position(|c| c.name == "do") {
        None => return Err(ParseError::MissingDo),
        Some(idx) if idx + 1 != calls.len() => {
            return Err(ParseError::TrailingInput {
                position: calls[idx].position,
            })
        }
        // do() 的参数（如 timeout）由执行器决定，这里忽略
        Some(_) => calls.pop_back(),
    };

    let ctor = calls
        .pop_front()
        .ok_or(ParseError::MissingAction)?;
    let mut action = construct(ctor)?;

    for mut call in calls {
        let name = call.name.clone();
        match name.as_str() {
            "above" | "below" | "left" | "right" => {
                let anchor = call.required_str("anchor")?;
                let position = call.position;
                call.finish()?;
                let target = target_mut(&mut action).ok_or_else(|| {
                    ParseError::argument(position, format!("'.{name}()' requires an action with a target"))
                })?;
                if let Some(rel) = relation(&name) {
                    target.anchors.push(crate::actions::Anchor {
                        value: anchor,
                        relation: rel,
                    });
                }
            }
            "offset" => {
                let x = call.optional_int("x")?.unwrap_or(0);
                let y = call.optional_int("y")?.unwrap_or(0);
                let position = call.position;
                call.finish()?;
                let target = target_mut(&mut action).ok_or_else(|| {
                    ParseError::argument(position, "'.offset()' requires an action with a target")
                })?;
                target.offset = (x, y);
            }
            other => {
                return Err(ParseError::UnknownMethod {
                    position: call.position,
                    name: other.to_string(),
                });
            }
        }
    }
    Ok(action)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn perform(input: &str) -> UiAction {
        match parse_action_string(input).unwrap() {
            CorrectiveAction::Perform(action) => action,
            CorrectiveAction::NoAction => panic!("expected an action"),
        }
    }

    #[test]
    fn test_left_click_with_anchor_and_offset() {
        let action = perform("LeftClick(target='OK').above(\"Cancel\").offset(x=5, y=-3).do()");
        assert_eq!(
            action,
            UiAction::left_click(Target::text("OK").above("Cancel").offset(5, -3))
        );
    }

    #[test]
    fn test_no_action() {
        assert_eq!(
            parse_action_string("NoAction  # the screen is fine").unwrap(),
            CorrectiveAction::NoAction
        );
    }

    #[test]
    fn test_send_keys_forms() {
        assert_eq!(perform("SendKeys('hello').do()"), UiAction::send_keys("hello"));

        let action = perform("SendKeys(keys=['a', 'b'], key_separator='tab', followed_by='enter').do()");
        match action {
            UiAction::SendKeys {
                keys,
                key_separator,
                followed_by,
                ..
            } => {
                assert_eq!(keys, Keys::Sequence(vec!["a".into(), "b".into()]));
                assert_eq!(key_separator.as_deref(), Some("tab"));
                assert_eq!(followed_by.as_deref(), Some("enter"));
            }
            other => panic!("unexpected action: {other:?}"),
        }
    }

    #[test]
    fn test_key_list_without_separator_rejected() {
        let err = parse_action_string("SendKeys(keys=['a', 'b']).do()").unwrap_err();
        assert!(err.to_string().contains("key_separator"));
    }

    #[test]
    fn test_window_and_hotkeys() {
        assert_eq!(
            perform("ActivateWindow(window_name='Excel*').do()"),
            UiAction::window(WindowOp::Activate, "Excel*")
        );
        assert_eq!(perform("PressKeys(keys='alt+f4').do()"), UiAction::press_keys("alt+f4"));
    }

    #[test]
    fn test_legacy_anchor_keywords() {
        let action = perform(
            "LeftClick(action_type='left_click', target='Save', anchor='File', relation='below').do()",
        );
        assert_eq!(action, UiAction::left_click(Target::text("Save").below("File")));
    }

    #[test]
    fn test_escaped_quotes() {
        let action = perform(r"LeftClick(target='Don\'t save').do()");
        assert_eq!(action, UiAction::left_click(Target::text("Don't save")));
    }

    #[test]
    fn test_rejects_actions_outside_recovery_set() {
        let err = parse_action_string("OpenApplication(app_path='x').do()").unwrap_err();
        assert!(matches!(err, ParseError::UnknownAction { position: 0, ref name } if name == "OpenApplication"));
        assert!(err.to_string().contains("Allowed actions: LeftClick, DoubleClick"));
    }

    #[test]
    fn test_requires_do() {
        let err = parse_action_string("LeftClick(target='OK')").unwrap_err();
        assert_eq!(err, ParseError::MissingDo);
        let err = parse_action_string("LeftClick(target='OK').do().above('x')").unwrap_err();
        assert!(matches!(err, ParseError::TrailingInput { .. }));
        assert!(err.to_string().contains("must be the last call"));
    }

    #[test]
    fn test_unexpected_argument() {
        let err = parse_action_string("LeftClick(target='OK', color='red').do()").unwrap_err();
        assert!(matches!(err, ParseError::BadArgument { .. }));
        assert!(err.to_string().contains("unexpected argument 'color'"));
    }

    #[test]
    fn test_garbage_is_rejected() {
        assert!(parse_action_string("import os; os.system('rm -rf /')").is_err());
        let err = parse_action_string("LeftClick(target=OK).do()").unwrap_err();
        assert_eq!(err, ParseError::literal(17, "unknown name 'OK'"));
        assert_eq!(err.position(), Some(17));
    }

    #[test]
    fn test_error_kinds() {
        assert_eq!(parse_action_string("   ").unwrap_err(), ParseError::Empty);
        assert!(matches!(
            parse_action_string("LeftClick(target='OK').blink().do()").unwrap_err(),
            ParseError::UnknownMethod { ref name, .. } if name == "blink"
        ));
        assert!(matches!(
            parse_action_string("LeftClick(target='OK' 'x').do()").unwrap_err(),
            ParseError::UnexpectedToken { .. }
        ));
        assert!(matches!(
            parse_action_string("LeftClick(target='OK).do()").unwrap_err(),
            ParseError::BadLiteral { position: 17, .. }
        ));
        assert_eq!(parse_action_string("do()").unwrap_err(), ParseError::MissingAction);
        assert!(matches!(
            parse_action_string("SendKeys(keys=['a', 'b']).do()").unwrap_err(),
            ParseError::InvalidAction(_)
        ));
    }
}
