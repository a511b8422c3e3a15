//! Time arithmetic. A duration is a [`Time`] counted from the epoch.

use super::{Builtins, Handler, Returns};
use crate::error::{Error, Result};
use crate::types::{Kind, Type};
use crate::value::{Data, RuntimeValue, Time};

const MINUTE: i64 = 60;
const HOUR: i64 = 60 * MINUTE;
const DAY: i64 = 24 * HOUR;

pub(super) fn register(table: &mut Builtins) {
    table.add(Kind::Time, "-time", Handler::Binary(minus), Returns::Time);
    table.add(Kind::Time, "*int", Handler::Binary(times), Returns::Time);
    table.add(Kind::Time, "*float", Handler::Binary(times), Returns::Time);
    table.add(Kind::Time, "seconds", Handler::Method(seconds), Returns::Int);
    table.add(Kind::Time, "minutes", Handler::Method(minutes), Returns::Int);
    table.add(Kind::Time, "hours", Handler::Method(hours), Returns::Int);
    table.add(Kind::Time, "days", Handler::Method(days), Returns::Int);
    table.add(Kind::Time, "unix", Handler::Method(unix), Returns::Int);
}

/// Multiplies a duration. The two never sentinels are left alone.
pub(super) fn scale(duration: Time, factor: f64) -> Time {
    if duration.is_never() {
        return duration;
    }
    let secs = duration.secs as f64 * factor;
    if secs >= i64::MAX as f64 {
        Time::NEVER_FUTURE
    } else if secs <= -(i64::MAX as f64) {
        Time::NEVER_PAST
    } else {
        Time::from_secs(secs as i64)
    }
}

fn difference(left: Time, right: Time) -> Time {
    if right == Time::NEVER_PAST {
        return Time::NEVER_FUTURE;
    }
    if right == Time::NEVER_FUTURE {
        return Time::NEVER_PAST;
    }
    if left.is_never() {
        return left;
    }
    match left.secs.checked_sub(right.secs) {
        Some(secs) => Time::from_secs(secs),
        None if left.secs > right.secs => Time::NEVER_FUTURE,
        None => Time::NEVER_PAST,
    }
}

fn minus(left: &RuntimeValue, right: &RuntimeValue) -> Result<RuntimeValue> {
    match (&left.data, &right.data) {
        (Data::Time(a), Data::Time(b)) => Ok(RuntimeValue::time(difference(*a, *b))),
        (Data::Nil, _) | (_, Data::Nil) => Ok(RuntimeValue::null_of(Type::Time)),
        _ => Err(Error::unsupported(format!("-{}", right.typ.label()), left.typ.label())),
    }
}

fn times(left: &RuntimeValue, right: &RuntimeValue) -> Result<RuntimeValue> {
    let factor = match &right.data {
        Data::Int(value) => *value as f64,
        Data::Float(value) => *value,
        Data::Nil => return Ok(RuntimeValue::null_of(Type::Time)),
        _ => return Err(Error::unsupported(format!("*{}", right.typ.label()), left.typ.label())),
    };
    Ok(match &left.data {
        Data::Time(time) => RuntimeValue::time(scale(*time, factor)),
        _ => RuntimeValue::null_of(Type::Time),
    })
}

fn in_units(receiver: &RuntimeValue, unit: i64) -> RuntimeValue {
    match &receiver.data {
        Data::Time(time) if *time == Time::NEVER_PAST => RuntimeValue::int(i64::MIN),
        Data::Time(time) if *time == Time::NEVER_FUTURE => RuntimeValue::int(i64::MAX),
        Data::Time(time) => RuntimeValue::int(time.secs / unit),
        _ => RuntimeValue::null_of(Type::Int),
    }
}

fn seconds(receiver: &RuntimeValue, _: &[RuntimeValue]) -> Result<RuntimeValue> {
    Ok(in_units(receiver, 1))
}

fn minutes(receiver: &RuntimeValue, _: &[RuntimeValue]) -> Result<RuntimeValue> {
    Ok(in_units(receiver, MINUTE))
}

fn hours(receiver: &RuntimeValue, _: &[RuntimeValue]) -> Result<RuntimeValue> {
    Ok(in_units(receiver, HOUR))
}

fn days(receiver: &RuntimeValue, _: &[RuntimeValue]) -> Result<RuntimeValue> {
    Ok(in_units(receiver, DAY))
}

fn unix(receiver: &RuntimeValue, _: &[RuntimeValue]) -> Result<RuntimeValue> {
    Ok(match &receiver.data {
        Data::Time(time) => RuntimeValue::int(time.secs),
        _ => RuntimeValue::null_of(Type::Int),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(secs: i64) -> RuntimeValue {
        RuntimeValue::time(Time::from_secs(secs))
    }

    #[test]
    fn subtraction_yields_durations() {
        let elapsed = minus(&at(1_700_000_000), &at(1_700_000_000 - 3 * DAY)).unwrap();
        assert_eq!(days(&elapsed, &[]).unwrap(), RuntimeValue::int(3));
        assert_eq!(hours(&elapsed, &[]).unwrap(), RuntimeValue::int(72));
    }

    #[test]
    fn never_sentinels_flip_and_saturate() {
        let past = RuntimeValue::time(Time::NEVER_PAST);
        let future = RuntimeValue::time(Time::NEVER_FUTURE);
        assert_eq!(minus(&at(5), &past).unwrap(), future);
        assert_eq!(minus(&at(5), &future).unwrap(), past);
        assert_eq!(minus(&future, &at(5)).unwrap(), future);
        assert_eq!(seconds(&past, &[]).unwrap(), RuntimeValue::int(i64::MIN));
        assert_eq!(minutes(&future, &[]).unwrap(), RuntimeValue::int(i64::MAX));
        assert_eq!(times(&future, &RuntimeValue::int(2)).unwrap(), future);
    }

    #[test]
    fn durations_scale() {
        assert_eq!(times(&at(90), &RuntimeValue::int(2)).unwrap(), at(180));
        assert_eq!(times(&at(90), &RuntimeValue::float(0.5)).unwrap(), at(45));
        assert_eq!(unix(&at(42), &[]).unwrap(), RuntimeValue::int(42));
        assert_eq!(
            minutes(&RuntimeValue::null_of(Type::Time), &[]).unwrap(),
            RuntimeValue::null_of(Type::Int)
        );
    }
}
