//! 自然语言里的时间、日期、邮箱与动词前缀解析
//!
//! 全部是纯函数，时钟一律由参数传入。日期解析遵循"最近的未来"规则：
//! 不带年份的日期取最近一次还没过去的；星期名取最近的那个（含今天）。

use std::sync::OnceLock;

use chrono::{Datelike, Days, NaiveDate, NaiveDateTime, NaiveTime, Weekday};
use regex::Regex;

fn clock_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)\b(\d{1,2})(?::(\d{2}))?\s*([ap]m)\b").expect("clock regex")
    })
}

fn email_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\b[\w.+-]+@[\w-]+(?:\.[\w-]+)+\b").expect("email regex"))
}

fn ordinal_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\b(\d{1,2})(?:st|nd|rd|th)\b").expect("ordinal regex"))
}

fn due_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)\bdue\s+(?:on\s+)?(.+)$").expect("due regex"))
}

/// 解析独立的时刻字符串："7:00 AM"、"7 PM"、"19:30"
pub fn parse_time_of_day(s: &str) -> Option<NaiveTime> {
    let normalized = s.trim().to_uppercase();
    for fmt in ["%I:%M %p", "%I %p", "%H:%M"] {
        if let Ok(time) = NaiveTime::parse_from_str(&normalized, fmt) {
            return Some(time);
        }
    }
    None
}

/// 从整句里抽第一个钟点（"at 3 pm" / "9:30am"）
pub fn extract_clock_time(text: &str) -> Option<NaiveTime> {
    let caps = clock_re().captures(text)?;
    let hour: u32 = caps[1].parse().ok()?;
    if !(1..=12).contains(&hour) {
        return None;
    }
    let minute: u32 = caps
        .get(2)
        .and_then(|m| m.as_str().parse().ok())
        .unwrap_or(0);
    let pm = caps[3].eq_ignore_ascii_case("pm");
    let hour24 = (hour % 12) + if pm { 12 } else { 0 };
    NaiveTime::from_hms_opt(hour24, minute, 0)
}

/// 从整句里抽第一个邮箱地址
pub fn extract_email(text: &str) -> Option<String> {
    email_re().find(text).map(|m| m.as_str().to_string())
}

/// 把任务描述与结尾的 "due (on) <短语>" 拆开
pub fn split_due_phrase(text: &str) -> (String, Option<String>) {
    match due_re().captures(text) {
        Some(caps) => {
            let full = caps.get(0).expect("whole match");
            let description = text[..full.start()].trim().to_string();
            let phrase = caps[1].trim().to_string();
            (description, Some(phrase))
        }
        None => (text.trim().to_string(), None),
    }
}

// 只接受完整词，前缀匹配会把 "friends" 当成 friday
fn weekday_from_name(name: &str) -> Option<Weekday> {
    match name {
        "monday" | "mon" => Some(Weekday::Mon),
        "tuesday" | "tue" | "tues" => Some(Weekday::Tue),
        "wednesday" | "wed" => Some(Weekday::Wed),
        "thursday" | "thu" | "thur" | "thurs" => Some(Weekday::Thu),
        "friday" | "fri" => Some(Weekday::Fri),
        "saturday" | "sat" => Some(Weekday::Sat),
        "sunday" | "sun" => Some(Weekday::Sun),
        _ => None,
    }
}

fn month_from_name(token: &str) -> Option<u32> {
    match token {
        "january" | "jan" => Some(1),
        "february" | "feb" => Some(2),
        "march" | "mar" => Some(3),
        "april" | "apr" => Some(4),
        "may" => Some(5),
        "june" | "jun" => Some(6),
        "july" | "jul" => Some(7),
        "august" | "aug" => Some(8),
        "september" | "sept" | "sep" => Some(9),
        "october" | "oct" => Some(10),
        "november" | "nov" => Some(11),
        "december" | "dec" => Some(12),
        _ => None,
    }
}

/// 解析日期短语：today / tomorrow / 星期名 / "6th oct" / "oct 6" / ISO。
/// 不带年份时取最近的未来（含今天）。解析不了返回 None。
pub fn parse_natural_date(phrase: &str, today: NaiveDate) -> Option<NaiveDate> {
    let lowered = phrase.trim().to_lowercase();
    let cleaned = ordinal_re().replace_all(&lowered, "$1").to_string();
    let cleaned = cleaned.strip_prefix("on ").unwrap_or(&cleaned).trim().to_string();

    match cleaned.as_str() {
        "today" => return Some(today),
        "tomorrow" => return today.checked_add_days(Days::new(1)),
        _ => {}
    }

    if let Ok(date) = NaiveDate::parse_from_str(&cleaned, "%Y-%m-%d") {
        return Some(date);
    }

    let (name, force_next) = match cleaned.strip_prefix("next ") {
        Some(rest) => (rest.trim(), true),
        None => (cleaned.as_str(), false),
    };
    if let Some(weekday) = weekday_from_name(name) {
        let mut ahead = (weekday.num_days_from_monday() + 7
            - today.weekday().num_days_from_monday())
            % 7;
        if ahead == 0 && force_next {
            ahead = 7;
        }
        return today.checked_add_days(Days::new(ahead as u64));
    }

    // "oct 6" / "6 october" / "october 6 2025"
    let mut month = None;
    let mut day = None;
    let mut year = None;
    for token in cleaned.split_whitespace() {
        if month.is_none() {
            if let Some(m) = month_from_name(token) {
                month = Some(m);
                continue;
            }
        }
        if let Ok(n) = token.parse::<u32>() {
            if n >= 1900 {
                year = Some(n as i32);
            } else if (1..=31).contains(&n) && day.is_none() {
                day = Some(n);
            }
        }
    }
    let (month, day) = (month?, day?);

    if let Some(year) = year {
        return NaiveDate::from_ymd_opt(year, month, day);
    }
    let this_year = NaiveDate::from_ymd_opt(today.year(), month, day)?;
    if this_year >= today {
        Some(this_year)
    } else {
        NaiveDate::from_ymd_opt(today.year() + 1, month, day)
    }
}

/// 在整句中找日期提法：按 3、2、1 个词的窗口扫描，先匹配到的算数。
/// 用于 "meet bob at 3 pm on friday" 这类日期混在句子里的输入。
pub fn find_date_phrase(text: &str, today: NaiveDate) -> Option<NaiveDate> {
    let lowered = text.to_lowercase();
    let tokens: Vec<&str> = lowered
        .split_whitespace()
        .map(|t| t.trim_matches(|c: char| !c.is_alphanumeric() && c != '-'))
        .filter(|t| !t.is_empty())
        .collect();
    for width in (1..=3.min(tokens.len())).rev() {
        for window in tokens.windows(width) {
            if let Some(date) = parse_natural_date(&window.join(" "), today) {
                return Some(date);
            }
        }
    }
    None
}

/// 日期缺省时补齐：时刻还没过→今天，过了→明天。返回 (时间点, 日期是否为推定)
pub fn nearest_future_datetime(
    time: NaiveTime,
    date: Option<NaiveDate>,
    now: NaiveDateTime,
) -> (NaiveDateTime, bool) {
    match date {
        Some(date) => (date.and_time(time), false),
        None => {
            let day = if now.time() < time {
                now.date()
            } else {
                now.date() + Days::new(1)
            };
            (day.and_time(time), true)
        }
    }
}

fn strip_prefixes<'a>(text: &'a str, prefixes: &[&str]) -> &'a str {
    let mut rest = text.trim();
    let mut changed = true;
    while changed {
        changed = false;
        for prefix in prefixes {
            // get 避开非 ASCII 输入上的字节边界
            let Some(head) = rest.get(..prefix.len()) else {
                continue;
            };
            if head.eq_ignore_ascii_case(prefix) {
                rest = rest[prefix.len()..].trim_start_matches([':', ',']).trim();
                changed = true;
            }
        }
    }
    rest
}

/// 去掉任务动词前缀："add task: buy milk" → "buy milk"
pub fn strip_task_prefixes(text: &str) -> String {
    strip_prefixes(
        text,
        &[
            "add a task",
            "add task",
            "remind me to",
            "reminder",
            "that i need to",
            "add",
        ],
    )
    .to_string()
}

/// 去掉检索动词前缀："search for rust" → "rust"
pub fn strip_search_prefixes(text: &str) -> String {
    strip_prefixes(
        text,
        &[
            "google search",
            "web search",
            "search for",
            "search",
            "look up",
            "google",
        ],
    )
    .to_string()
}

/// 抽 "subject: ..." 与 "body: ..." 标记段
pub fn extract_subject_body(text: &str) -> (Option<String>, Option<String>) {
    static SUBJECT_RE: OnceLock<Regex> = OnceLock::new();
    static BODY_RE: OnceLock<Regex> = OnceLock::new();
    let subject_re = SUBJECT_RE
        .get_or_init(|| Regex::new(r"(?is)\bsubject:\s*(.*?)(?:\bbody:|$)").expect("subject regex"));
    let body_re =
        BODY_RE.get_or_init(|| Regex::new(r"(?is)\bbody:\s*(.+)$").expect("body regex"));

    let subject = subject_re
        .captures(text)
        .map(|c| c[1].trim().to_string())
        .filter(|s| !s.is_empty());
    let body = body_re
        .captures(text)
        .map(|c| c[1].trim().to_string())
        .filter(|s| !s.is_empty());
    (subject, body)
}
