//! Cron 表达式解析
//!
//! 6 字段格式：`秒 分 时 日 月 周`
//!
//! 每个字段支持 `*`、数字、`a-b` 区间、`/步长`、逗号列表；
//! 月份支持 `JAN-DEC`，星期支持 `SUN-SAT` 和 `0-7`（0 和 7 都是周日）；
//! 日和周字段允许使用 `?` 表示不限定。日与周需同时满足。
//!
//! 下次触发时间的计算是纯函数，不依赖当前时钟

use bit_set::BitSet;
use chrono::{Datelike, Duration, NaiveDate, NaiveDateTime, Timelike};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// 向前搜索的最大年数，超过则认为表达式永不触发
const SEARCH_YEARS: i32 = 5;

const MONTH_NAMES: &[&str] = &[
    "JAN", "FEB", "MAR", "APR", "MAY", "JUN", "JUL", "AUG", "SEP", "OCT", "NOV", "DEC",
];
const DAY_NAMES: &[&str] = &["SUN", "MON", "TUE", "WED", "THU", "FRI", "SAT"];

/// Cron 解析错误
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CronError {
    #[error("cron 表达式必须包含 6 个字段，实际为 {count} 个: '{expression}'")]
    FieldCount { count: usize, expression: String },

    #[error("{field} 字段无效 '{value}': {reason}")]
    InvalidField {
        field: &'static str,
        value: String,
        reason: String,
    },
}

/// 字段定义
struct FieldSpec {
    name: &'static str,
    min: u32,
    max: u32,
    /// 名称别名，第 i 个名称对应 `names_base + i`
    names: &'static [&'static str],
    names_base: u32,
    /// 是否允许 `?`
    allow_any: bool,
}

const SECONDS: FieldSpec = FieldSpec {
    name: "秒",
    min: 0,
    max: 59,
    names: &[],
    names_base: 0,
    allow_any: false,
};
const MINUTES: FieldSpec = FieldSpec {
    name: "分",
    min: 0,
    max: 59,
    names: &[],
    names_base: 0,
    allow_any: false,
};
const HOURS: FieldSpec = FieldSpec {
    name: "时",
    min: 0,
    max: 23,
    names: &[],
    names_base: 0,
    allow_any: false,
};
const DAYS_OF_MONTH: FieldSpec = FieldSpec {
    name: "日",
    min: 1,
    max: 31,
    names: &[],
    names_base: 0,
    allow_any: true,
};
const MONTHS: FieldSpec = FieldSpec {
    name: "月",
    min: 1,
    max: 12,
    names: MONTH_NAMES,
    names_base: 1,
    allow_any: false,
};
// 7 在解析后折叠为 0
const DAYS_OF_WEEK: FieldSpec = FieldSpec {
    name: "周",
    min: 0,
    max: 7,
    names: DAY_NAMES,
    names_base: 0,
    allow_any: true,
};

impl FieldSpec {
    fn error(&self, value: &str, reason: impl Into<String>) -> CronError {
        CronError::InvalidField {
            field: self.name,
            value: value.to_string(),
            reason: reason.into(),
        }
    }

    fn parse_value(&self, token: &str) -> Result<u32, CronError> {
        let upper = token.to_ascii_uppercase();
        if let Some(pos) = self.names.iter().position(|name| *name == upper) {
            return Ok(self.names_base + pos as u32);
        }
        let value: u32 = token
            .parse()
            .map_err(|_| self.error(token, "不是有效的数字"))?;
        if value < self.min || value > self.max {
            return Err(self.error(
                token,
                format!("超出范围 {}-{}", self.min, self.max),
            ));
        }
        Ok(value)
    }

    fn parse(&self, text: &str) -> Result<BitSet, CronError> {
        let mut set = BitSet::with_capacity(self.max as usize + 1);

        for part in text.split(',') {
            if part.is_empty() {
                return Err(self.error(text, "列表中存在空项"));
            }

            let (range, step) = match part.split_once('/') {
                Some((range, step)) => {
                    let step: u32 = step
                        .parse()
                        .map_err(|_| self.error(part, "步长不是有效的数字"))?;
                    if step == 0 {
                        return Err(self.error(part, "步长必须大于 0"));
                    }
                    (range, Some(step))
                }
                None => (part, None),
            };

            let (start, end) = if range == "*" || range == "?" {
                if range == "?" && !self.allow_any {
                    return Err(self.error(part, "该字段不支持 '?'"));
                }
                (self.min, self.max)
            } else if let Some((from, to)) = range.split_once('-') {
                (self.parse_value(from)?, self.parse_value(to)?)
            } else {
                let value = self.parse_value(range)?;
                // `5/15` 表示从 5 开始每 15 个单位
                if step.is_some() {
                    (value, self.max)
                } else {
                    (value, value)
                }
            };

            if start > end {
                return Err(self.error(part, "区间起始值大于结束值"));
            }

            let step = step.unwrap_or(1) as usize;
            for value in (start..=end).step_by(step) {
                set.insert(value as usize);
            }
        }

        Ok(set)
    }
}

/// 已解析的 cron 表达式
#[derive(Debug, Clone)]
pub struct CronSchedule {
    expression: String,
    seconds: BitSet,
    minutes: BitSet,
    hours: BitSet,
    days_of_month: BitSet,
    months: BitSet,
    days_of_week: BitSet,
}

impl CronSchedule {
    /// 解析 cron 表达式
    pub fn parse(expression: &str) -> Result<Self, CronError> {
        let fields: Vec<&str> = expression.split_whitespace().collect();
        let [sec, min, hour, dom, month, dow] = fields.as_slice() else {
            return Err(CronError::FieldCount {
                count: fields.len(),
                expression: expression.to_string(),
            });
        };

        let mut days_of_week = DAYS_OF_WEEK.parse(dow)?;
        if days_of_week.remove(7) {
            days_of_week.insert(0);
        }

        Ok(Self {
            expression: fields.join(" "),
            seconds: SECONDS.parse(sec)?,
            minutes: MINUTES.parse(min)?,
            hours: HOURS.parse(hour)?,
            days_of_month: DAYS_OF_MONTH.parse(dom)?,
            months: MONTHS.parse(month)?,
            days_of_week,
        })
    }

    /// 规范化后的表达式
    pub fn expression(&self) -> &str {
        &self.expression
    }

    /// 判断给定时间（精确到秒）是否命中表达式
    pub fn matches(&self, time: NaiveDateTime) -> bool {
        self.date_matches(time.date())
            && self.hours.contains(time.hour() as usize)
            && self.minutes.contains(time.minute() as usize)
            && self.seconds.contains(time.second() as usize)
    }

    fn date_matches(&self, date: NaiveDate) -> bool {
        self.months.contains(date.month() as usize)
            && self.days_of_month.contains(date.day() as usize)
            && self
                .days_of_week
                .contains(date.weekday().num_days_from_sunday() as usize)
    }

    /// 计算严格晚于 `after` 的下一次触发时间
    ///
    /// 在未来若干年内都无法命中时返回 `None`（例如 `0 0 0 31 2 *`）
    pub fn next_after(&self, after: NaiveDateTime) -> Option<NaiveDateTime> {
        let mut time = after.with_nanosecond(0)? + Duration::seconds(1);
        let limit_year = time.year() + SEARCH_YEARS;

        while time.year() <= limit_year {
            if !self.months.contains(time.month() as usize) {
                let (year, month) = if time.month() == 12 {
                    (time.year() + 1, 1)
                } else {
                    (time.year(), time.month() + 1)
                };
                time = NaiveDate::from_ymd_opt(year, month, 1)?.and_hms_opt(0, 0, 0)?;
                continue;
            }

            if !self.date_matches(time.date()) {
                time = time.date().succ_opt()?.and_hms_opt(0, 0, 0)?;
                continue;
            }

            if !self.hours.contains(time.hour() as usize) {
                time = time.date().and_hms_opt(time.hour(), 0, 0)? + Duration::hours(1);
                continue;
            }

            if !self.minutes.contains(time.minute() as usize) {
                time = time
                    .date()
                    .and_hms_opt(time.hour(), time.minute(), 0)?
                    + Duration::minutes(1);
                continue;
            }

            if !self.seconds.contains(time.second() as usize) {
                time += Duration::seconds(1);
                continue;
            }

            return Some(time);
        }

        None
    }
}

impl FromStr for CronSchedule {
    type Err = CronError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for CronSchedule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.expression)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn at(y: i32, mo: u32, d: u32, h: u32, mi: u32, s: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(y, mo, d)
            .unwrap()
            .and_hms_opt(h, mi, s)
            .unwrap()
    }

    #[test]
    fn test_every_second() {
        let cron = CronSchedule::parse("* * * * * *").unwrap();
        let now = at(2024, 3, 10, 12, 0, 0);
        assert_eq!(cron.next_after(now), Some(at(2024, 3, 10, 12, 0, 1)));
    }

    #[test]
    fn test_sub_second_input_rounds_up() {
        let cron = CronSchedule::parse("* * * * * *").unwrap();
        let now = at(2024, 3, 10, 12, 0, 0) + Duration::milliseconds(900);
        assert_eq!(cron.next_after(now), Some(at(2024, 3, 10, 12, 0, 1)));
    }

    #[test]
    fn test_step_and_list() {
        let cron = CronSchedule::parse("0 */15 8,20 * * ?").unwrap();
        assert_eq!(
            cron.next_after(at(2024, 1, 1, 8, 16, 0)),
            Some(at(2024, 1, 1, 8, 30, 0))
        );
        assert_eq!(
            cron.next_after(at(2024, 1, 1, 8, 45, 0)),
            Some(at(2024, 1, 1, 20, 0, 0))
        );
        assert_eq!(
            cron.next_after(at(2024, 1, 1, 20, 45, 0)),
            Some(at(2024, 1, 2, 8, 0, 0))
        );
    }

    #[test]
    fn test_offset_step() {
        let cron = CronSchedule::parse("5/20 * * * * *").unwrap();
        assert_eq!(
            cron.next_after(at(2024, 1, 1, 0, 0, 6)),
            Some(at(2024, 1, 1, 0, 0, 25))
        );
        assert_eq!(
            cron.next_after(at(2024, 1, 1, 0, 0, 45)),
            Some(at(2024, 1, 1, 0, 1, 5))
        );
    }

    #[test]
    fn test_month_and_day_names() {
        // 2024-01-01 是周一
        let cron = CronSchedule::parse("0 30 2 ? FEB MON-FRI").unwrap();
        assert_eq!(
            cron.next_after(at(2024, 1, 1, 0, 0, 0)),
            Some(at(2024, 2, 1, 2, 30, 0))
        );
        // 2024-02-03 是周六，跳到周一
        assert_eq!(
            cron.next_after(at(2024, 2, 2, 3, 0, 0)),
            Some(at(2024, 2, 5, 2, 30, 0))
        );
    }

    #[test]
    fn test_sunday_as_seven() {
        let zero = CronSchedule::parse("0 0 0 * * 0").unwrap();
        let seven = CronSchedule::parse("0 0 0 * * 7").unwrap();
        let now = at(2024, 1, 1, 0, 0, 0);
        assert_eq!(zero.next_after(now), Some(at(2024, 1, 7, 0, 0, 0)));
        assert_eq!(seven.next_after(now), zero.next_after(now));
    }

    #[test]
    fn test_year_rollover_and_leap_day() {
        let cron = CronSchedule::parse("0 0 0 29 2 *").unwrap();
        assert_eq!(
            cron.next_after(at(2024, 3, 1, 0, 0, 0)),
            Some(at(2028, 2, 29, 0, 0, 0))
        );
    }

    #[test]
    fn test_never_matches() {
        let cron = CronSchedule::parse("0 0 0 31 2 *").unwrap();
        assert_eq!(cron.next_after(at(2024, 1, 1, 0, 0, 0)), None);
    }

    #[test]
    fn test_invalid_expressions() {
        assert!(matches!(
            CronSchedule::parse("* * * * *"),
            Err(CronError::FieldCount { count: 5, .. })
        ));
        assert!(CronSchedule::parse("60 * * * * *").is_err());
        assert!(CronSchedule::parse("* * 24 * * *").is_err());
        assert!(CronSchedule::parse("* * * 0 * *").is_err());
        assert!(CronSchedule::parse("* * * * 13 *").is_err());
        assert!(CronSchedule::parse("*/0 * * * * *").is_err());
        assert!(CronSchedule::parse("10-5 * * * * *").is_err());
        assert!(CronSchedule::parse("1,,2 * * * * *").is_err());
        assert!(CronSchedule::parse("? * * * * *").is_err());
        assert!(CronSchedule::parse("a * * * * *").is_err());
    }

    #[test]
    fn test_expression_is_normalized() {
        let cron: CronSchedule = "0   0  12 * *  ?".parse().unwrap();
        assert_eq!(cron.expression(), "0 0 12 * * ?");
        assert_eq!(cron.to_string(), "0 0 12 * * ?");
    }

    proptest! {
        #[test]
        fn prop_next_is_later_and_matches(
            step in 1u32..30,
            hour in 0u32..24,
            offset_secs in 0i64..(400 * 24 * 3600),
        ) {
            let cron = CronSchedule::parse(&format!("*/{} * {} * * *", step, hour)).unwrap();
            let after = at(2023, 1, 1, 0, 0, 0) + Duration::seconds(offset_secs);
            let next = cron.next_after(after).unwrap();

            prop_assert!(next > after);
            prop_assert!(cron.matches(next));
            prop_assert_eq!(next.second() % step, 0);
            prop_assert!(next - after <= Duration::days(1) + Duration::seconds(1));
        }

        #[test]
        fn prop_no_match_is_skipped(offset_secs in 0i64..(3 * 24 * 3600)) {
            let cron = CronSchedule::parse("0,30 */7 * * * *").unwrap();
            let after = at(2024, 6, 1, 0, 0, 0) + Duration::seconds(offset_secs);
            let next = cron.next_after(after).unwrap();

            let mut instant = after + Duration::seconds(1);
            while instant < next {
                prop_assert!(!cron.matches(instant));
                instant += Duration::seconds(1);
            }
        }
    }
}
