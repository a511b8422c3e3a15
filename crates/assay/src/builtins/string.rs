use std::sync::OnceLock;

use regex::Regex;

use super::{arg_value, Builtins, Handler, Returns};
use crate::error::{Error, Result};
use crate::types::{Kind, Type};
use crate::value::{Data, RuntimeValue};

const DEFAULT_CUTSET: &str = " \t\n\r";

pub(super) fn register(table: &mut Builtins) {
    table.add(Kind::String, "+string", Handler::Binary(concat), Returns::String);
    table.add(Kind::String, "contains", Handler::Method(contains), Returns::Bool);
    table.add(Kind::String, "find", Handler::Method(find), Returns::StringArray);
    table.add(Kind::String, "camelcase", Handler::Method(camelcase), Returns::String);
    table.add(Kind::String, "downcase", Handler::Method(downcase), Returns::String);
    table.add(Kind::String, "upcase", Handler::Method(upcase), Returns::String);
    table.add(Kind::String, "length", Handler::Method(length), Returns::Int);
    table.add(Kind::String, "lines", Handler::Method(lines), Returns::StringArray);
    table.add(Kind::String, "split", Handler::Method(split), Returns::StringArray);
    table.add(Kind::String, "trim", Handler::Method(trim), Returns::String);
}

fn strings(items: impl IntoIterator<Item = String>) -> RuntimeValue {
    RuntimeValue::array(items.into_iter().map(Data::String).collect(), Type::String)
}

fn concat(left: &RuntimeValue, right: &RuntimeValue) -> Result<RuntimeValue> {
    match (&left.data, &right.data) {
        (Data::String(a), Data::String(b)) => Ok(RuntimeValue::string(format!("{a}{b}"))),
        _ => Ok(RuntimeValue::null_of(Type::String)),
    }
}

pub(super) fn contains(receiver: &RuntimeValue, args: &[RuntimeValue]) -> Result<RuntimeValue> {
    let Data::String(text) = &receiver.data else {
        return Ok(RuntimeValue::bool(false));
    };
    let needle = arg_value(args, 0, "contains")?;
    let found = match &needle.data {
        Data::Nil => false,
        Data::String(part) => text.contains(part.as_str()),
        Data::Int(number) => text.contains(&number.to_string()),
        Data::Array(items) => items.iter().any(|item| match item {
            Data::String(part) => text.contains(part.as_str()),
            Data::Int(number) => text.contains(&number.to_string()),
            _ => false,
        }),
        _ => {
            return Err(Error::type_mismatch(
                "string, int, []string or []int",
                needle.describe(),
            ))
        }
    };
    Ok(RuntimeValue::bool(found))
}

pub(super) fn find(receiver: &RuntimeValue, args: &[RuntimeValue]) -> Result<RuntimeValue> {
    let Data::String(text) = &receiver.data else {
        return Ok(strings(Vec::new()));
    };
    let pattern = arg_value(args, 0, "find")?;
    let re = match &pattern.data {
        Data::Nil => return Ok(strings(Vec::new())),
        Data::Regex(re) => re.clone(),
        Data::String(raw) => std::sync::Arc::new(Regex::new(raw).map_err(|_| {
            Error::eval(format!("failed to compile regular expression: {raw}"))
        })?),
        _ => return Err(Error::type_mismatch("regex", pattern.describe())),
    };
    Ok(strings(
        re.find_iter(text).map(|found| found.as_str().to_string()),
    ))
}

fn camelcase_re() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"([[:punct:]]|\s)+\p{L}").ok())
        .as_ref()
}

pub(super) fn camelcase(receiver: &RuntimeValue, _: &[RuntimeValue]) -> Result<RuntimeValue> {
    let Data::String(text) = &receiver.data else {
        return Ok(RuntimeValue::null_of(Type::String));
    };
    let re = camelcase_re().ok_or_else(|| Error::eval("camelcase pattern failed to compile"))?;
    let result = re.replace_all(text, |caps: &regex::Captures<'_>| {
        caps[0]
            .chars()
            .last()
            .map(|letter| letter.to_uppercase().collect::<String>())
            .unwrap_or_default()
    });
    Ok(RuntimeValue::string(result))
}

pub(super) fn downcase(receiver: &RuntimeValue, _: &[RuntimeValue]) -> Result<RuntimeValue> {
    Ok(match &receiver.data {
        Data::String(text) => RuntimeValue::string(text.to_lowercase()),
        _ => RuntimeValue::null_of(Type::String),
    })
}

pub(super) fn upcase(receiver: &RuntimeValue, _: &[RuntimeValue]) -> Result<RuntimeValue> {
    Ok(match &receiver.data {
        Data::String(text) => RuntimeValue::string(text.to_uppercase()),
        _ => RuntimeValue::null_of(Type::String),
    })
}

/// Length in bytes.
fn length(receiver: &RuntimeValue, _: &[RuntimeValue]) -> Result<RuntimeValue> {
    Ok(match &receiver.data {
        Data::String(text) => RuntimeValue::int(text.len() as i64),
        _ => RuntimeValue::null_of(Type::Int),
    })
}

pub(super) fn lines(receiver: &RuntimeValue, _: &[RuntimeValue]) -> Result<RuntimeValue> {
    Ok(match &receiver.data {
        Data::String(text) => strings(text.split('\n').map(str::to_string)),
        _ => RuntimeValue::null_of(Type::array(Type::String)),
    })
}

pub(super) fn split(receiver: &RuntimeValue, args: &[RuntimeValue]) -> Result<RuntimeValue> {
    let Data::String(text) = &receiver.data else {
        return Ok(RuntimeValue::null_of(Type::array(Type::String)));
    };
    let separator = arg_value(args, 0, "split")?;
    match &separator.data {
        Data::String(separator) => Ok(strings(text.split(separator.as_str()).map(str::to_string))),
        Data::Nil => Ok(RuntimeValue::typed_error(
            Type::array(Type::String),
            Error::eval("failed to split string, separator was null"),
        )),
        _ => Err(Error::type_mismatch("string separator", separator.describe())),
    }
}

pub(super) fn trim(receiver: &RuntimeValue, args: &[RuntimeValue]) -> Result<RuntimeValue> {
    let Data::String(text) = &receiver.data else {
        return Ok(RuntimeValue::null_of(Type::String));
    };
    let cutset = match args.first().map(|arg| &arg.data) {
        None => DEFAULT_CUTSET,
        Some(Data::String(cutset)) => cutset.as_str(),
        Some(Data::Nil) => {
            return Ok(RuntimeValue::typed_error(
                Type::String,
                Error::eval("failed to trim string, cutset was null"),
            ))
        }
        Some(_) => return Err(Error::type_mismatch("string cutset", args[0].describe())),
    };
    let trimmed = text.trim_matches(|c: char| cutset.contains(c));
    Ok(RuntimeValue::string(trimmed))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn s(value: &str) -> RuntimeValue {
        RuntimeValue::string(value)
    }

    #[test]
    fn contains_accepts_numbers_and_lists() {
        let text = s("listen 8080");
        assert_eq!(contains(&text, &[s("8080")]).unwrap(), RuntimeValue::bool(true));
        assert_eq!(contains(&text, &[RuntimeValue::int(80)]).unwrap(), RuntimeValue::bool(true));
        let ports = RuntimeValue::array(vec![Data::Int(22), Data::Int(8080)], Type::Int);
        assert_eq!(contains(&text, &[ports]).unwrap(), RuntimeValue::bool(true));
        let words = RuntimeValue::array(vec![Data::String("closed".into())], Type::String);
        assert_eq!(contains(&text, &[words]).unwrap(), RuntimeValue::bool(false));
        assert_eq!(
            contains(&RuntimeValue::null_of(Type::String), &[s("x")]).unwrap(),
            RuntimeValue::bool(false)
        );
    }

    #[test]
    fn find_collects_every_match() {
        let found = find(&s("a1 b22 c333"), &[RuntimeValue::regex(r"\d+").unwrap()]).unwrap();
        assert_eq!(
            found.data,
            Data::array(vec![
                Data::String("1".into()),
                Data::String("22".into()),
                Data::String("333".into()),
            ])
        );
        assert!(find(&s("x"), &[s("(")]).is_err());
    }

    #[test]
    fn camelcase_joins_words() {
        assert_eq!(camelcase(&s("hello world-wide_web"), &[]).unwrap(), s("helloWorldWideWeb"));
        assert_eq!(upcase(&s("MiXed"), &[]).unwrap(), s("MIXED"));
        assert_eq!(downcase(&s("MiXed"), &[]).unwrap(), s("mixed"));
    }

    #[test]
    fn split_and_lines() {
        let parts = split(&s("a,b,,c"), &[s(",")]).unwrap();
        assert_eq!(parts.data.as_array().map(<[Data]>::len), Some(4));
        let null_sep = split(&s("a"), &[RuntimeValue::null_of(Type::String)]).unwrap();
        assert!(null_sep.is_error());
        let rows = lines(&s("one\ntwo"), &[]).unwrap();
        assert_eq!(rows.element(1), Some(s("two")));
    }

    #[test]
    fn trim_uses_default_or_given_cutset() {
        assert_eq!(trim(&s("\t padded \n"), &[]).unwrap(), s("padded"));
        assert_eq!(trim(&s("--x--"), &[s("-")]).unwrap(), s("x"));
        assert_eq!(length(&s("four"), &[]).unwrap(), RuntimeValue::int(4));
    }

    #[test]
    fn concatenation() {
        assert_eq!(concat(&s("ab"), &s("cd")).unwrap(), s("abcd"));
        assert_eq!(
            concat(&RuntimeValue::null_of(Type::String), &s("cd")).unwrap(),
            RuntimeValue::null_of(Type::String)
        );
    }
}
