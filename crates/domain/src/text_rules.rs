//! 文本消息解析规则
//!
//! 引用块、@提及和改群名通知都只能从纯文本里识别，这里集中放置这些规则。

use std::sync::LazyLock;

use regex::Regex;

/// 平台群名片的最大字符数
pub const NAME_MATCH_LIMIT: usize = 16;

/// 平台在 @名字 之后插入的不可见分隔符
pub const MENTION_MARKER: char = '\u{2005}';

struct QuoteStyle {
    prefix: &'static str,
    suffix: &'static str,
    separator: &'static str,
}

const QUOTE_STYLES: [QuoteStyle; 2] = [
    QuoteStyle {
        prefix: "「",
        suffix: "」\n- - - - - - - - - - - - - - -\n",
        separator: "：",
    },
    QuoteStyle {
        prefix: "\"",
        suffix: "\"\n- - - - - - - - - - - - - - -\n",
        separator: ": ",
    },
];

/// 引用块拆分结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QuotedText<'a> {
    /// 引用部分，形如 `作者：内容`
    pub quoted: &'a str,
    /// 引用块之后的正文
    pub body: &'a str,
    /// 作者与内容之间的分隔符
    pub separator: &'static str,
}

impl<'a> QuotedText<'a> {
    /// 在群成员中查找引用作者，返回 (作者名, 去掉作者后的引用内容, 查找结果)
    pub fn split_author<T>(
        &self,
        lookup: impl FnMut(&str) -> Option<T>,
    ) -> Option<(String, &'a str, T)> {
        let (author, found) = match_name_prefix(self.quoted, self.separator, lookup)?;
        let content = match self
            .quoted
            .strip_prefix(author.as_str())
            .map(|rest| rest.strip_prefix(self.separator))
        {
            Some(Some(rest)) => rest,
            Some(None) if self.quoted.len() == author.len() => "",
            _ => self.quoted,
        };
        Some((author, content, found))
    }
}

/// 识别两种语言环境下的引用格式；不是引用消息时返回 `None`
pub fn extract_quote(text: &str) -> Option<QuotedText<'_>> {
    QUOTE_STYLES.iter().find_map(|style| {
        let rest = text.strip_prefix(style.prefix)?;
        let end = rest.find(style.suffix)?;
        Some(QuotedText {
            quoted: &rest[..end],
            body: &rest[end + style.suffix.len()..],
            separator: style.separator,
        })
    })
}

/// 名字前缀匹配：截断到名片长度上限后按分隔符切分，从最长的组合开始尝试，
/// 最长的命中者胜出。
pub fn match_name_prefix<T>(
    content: &str,
    separator: &str,
    mut lookup: impl FnMut(&str) -> Option<T>,
) -> Option<(String, T)> {
    let bounded: String = content.chars().take(NAME_MATCH_LIMIT).collect();
    let parts: Vec<&str> = bounded.trim().split(separator).collect();
    for end in (1..=parts.len()).rev() {
        let candidate = parts[..end].join(separator);
        if candidate.is_empty() {
            continue;
        }
        if let Some(found) = lookup(&candidate) {
            return Some((candidate, found));
        }
    }
    None
}

/// 文本中 @ 的位置信息
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MentionTarget<'a> {
    /// 带分隔符，名字已经确定
    Marked(&'a str),
    /// 没有分隔符，需要对 @ 之后的文本做前缀匹配
    Unmarked(&'a str),
}

pub fn locate_mention(content: &str) -> Option<MentionTarget<'_>> {
    let at = content.find('@')?;
    let after = &content[at + 1..];
    match after.find(MENTION_MARKER) {
        Some(pos) => Some(MentionTarget::Marked(after[..pos].trim())),
        None => Some(MentionTarget::Unmarked(after)),
    }
}

/// 去掉第一个提及分隔符
pub fn strip_mention_marker(content: &str) -> String {
    content.replacen(MENTION_MARKER, "", 1)
}

/// `@name ` 或 `@name` 在文本中的字符偏移与长度；找不到时为 (-1, 0)
pub fn mention_span(content: &str, name: &str) -> (i32, i32) {
    for flag in [format!("@{name} "), format!("@{name}")] {
        if let Some(index) = content.find(&flag) {
            let offset = content[..index].chars().count();
            let length = flag.chars().count();
            return (offset as i32, length as i32);
        }
    }
    (-1, 0)
}

static RENAME_ZH: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#""(.*?)"修改群名为“(.*?)”"#).expect("valid rename pattern"));
static RENAME_EN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#""(.*?)" changed the group name to "(.*?)""#).expect("valid rename pattern")
});

/// 改群名通知，返回 (操作者名字, 新群名)
pub fn parse_rename_group(content: &str) -> Option<(&str, &str)> {
    let pattern = if content.contains("修改群名为") {
        &RENAME_ZH
    } else if content.contains("changed the group name to") {
        &RENAME_EN
    } else {
        return None;
    };
    let captures = pattern.captures(content)?;
    Some((captures.get(1)?.as_str(), captures.get(2)?.as_str()))
}
