use crate::udbc::error::DriverError;
use crate::udbc::value::Value;
use chrono::{Datelike, NaiveDate, NaiveDateTime, NaiveTime, Timelike};
use mysql_async::consts::ColumnType;
use mysql_async::{Column, Value as MyValue};
use rust_decimal::Decimal;
use std::str::FromStr;

pub fn from_mysql_value(v: &MyValue) -> Value {
    match v {
        MyValue::NULL => Value::Null,
        MyValue::Int(i) => Value::I64(*i),
        MyValue::UInt(u) => i64::try_from(*u)
            .map(Value::I64)
            .unwrap_or_else(|_| Value::Str(u.to_string())),
        MyValue::Float(f) => Value::F64(*f as f64),
        MyValue::Double(d) => Value::F64(*d),
        // 文本协议下所有列都以字节返回
        MyValue::Bytes(b) => match std::str::from_utf8(b) {
            Ok(s) => Value::Str(s.to_string()),
            Err(_) => Value::Bytes(b.clone()),
        },
        MyValue::Date(y, m, d, h, min, s, micro) => {
            let Some(date) = NaiveDate::from_ymd_opt(*y as i32, *m as u32, *d as u32) else {
                // zero dates such as 0000-00-00
                return Value::Null;
            };
            if *h == 0 && *min == 0 && *s == 0 && *micro == 0 {
                return Value::Date(date);
            }
            date.and_hms_micro_opt(*h as u32, *min as u32, *s as u32, *micro)
                .map(Value::DateTime)
                .unwrap_or(Value::Date(date))
        }
        MyValue::Time(is_neg, days, h, min, s, micro) => {
            let total_h = *days * 24 + (*h as u32);
            match NaiveTime::from_hms_micro_opt(total_h, *min as u32, *s as u32, *micro) {
                Some(t) if !*is_neg => Value::Time(t),
                _ => Value::Str(format!(
                    "{}{}:{:02}:{:02}.{:06}",
                    if *is_neg { "-" } else { "" },
                    total_h,
                    min,
                    s,
                    micro
                )),
            }
        }
    }
}

/// Like [`from_mysql_value`], but parses text-protocol numbers using the
/// column type.
pub fn from_mysql_column(v: &MyValue, column: &Column) -> Value {
    let MyValue::Bytes(b) = v else {
        return from_mysql_value(v);
    };
    let Ok(text) = std::str::from_utf8(b) else {
        return Value::Bytes(b.clone());
    };
    let parsed = match column.column_type() {
        ColumnType::MYSQL_TYPE_TINY
        | ColumnType::MYSQL_TYPE_SHORT
        | ColumnType::MYSQL_TYPE_LONG
        | ColumnType::MYSQL_TYPE_INT24
        | ColumnType::MYSQL_TYPE_LONGLONG
        | ColumnType::MYSQL_TYPE_YEAR => text.parse::<i64>().ok().map(Value::I64),
        ColumnType::MYSQL_TYPE_FLOAT | ColumnType::MYSQL_TYPE_DOUBLE => {
            text.parse::<f64>().ok().map(Value::F64)
        }
        ColumnType::MYSQL_TYPE_DECIMAL | ColumnType::MYSQL_TYPE_NEWDECIMAL => {
            Decimal::from_str(text).ok().map(Value::Decimal)
        }
        _ => None,
    };
    parsed.unwrap_or_else(|| Value::Str(text.to_string()))
}

fn date_value(date: NaiveDate, time: NaiveTime) -> MyValue {
    MyValue::Date(
        date.year() as u16,
        date.month() as u8,
        date.day() as u8,
        time.hour() as u8,
        time.minute() as u8,
        time.second() as u8,
        time.nanosecond() / 1000,
    )
}

pub fn to_mysql_value(v: &Value) -> Result<MyValue, DriverError> {
    Ok(match v {
        Value::Null => MyValue::NULL,
        Value::Bool(b) => MyValue::Int(if *b { 1 } else { 0 }),
        Value::I16(i) => MyValue::Int(*i as i64),
        Value::I32(i) => MyValue::Int(*i as i64),
        Value::I64(i) => MyValue::Int(*i),
        Value::U8(u) => MyValue::UInt(*u as u64),
        Value::F64(f) => MyValue::Double(*f),
        Value::Str(s) => MyValue::Bytes(s.clone().into_bytes()),
        Value::Bytes(b) => MyValue::Bytes(b.clone()),
        Value::Date(d) => date_value(*d, NaiveTime::MIN),
        Value::Time(t) => MyValue::Time(
            false,
            0u32,
            t.hour() as u8,
            t.minute() as u8,
            t.second() as u8,
            t.nanosecond() / 1000,
        ),
        Value::DateTime(dt) => date_value(dt.date(), dt.time()),
        Value::DateTimeUtc(dt) => {
            let ndt: NaiveDateTime = dt.naive_utc();
            date_value(ndt.date(), ndt.time())
        }
        Value::Decimal(d) => MyValue::Bytes(d.to_string().into_bytes()),
        Value::List(_) => {
            return Err(DriverError::Unsupported(
                "list parameters are not supported by mysql".into(),
            ));
        }
    })
}
