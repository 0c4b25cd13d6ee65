//! 路径转换 - 统一分隔符并在源/目标根目录之间映射路径

use regex::Regex;
use std::sync::LazyLock;

/// 连续的反斜杠统一折叠为一个正斜杠
static BACKSLASHES: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\\+").expect("静态正则表达式"));

/// 规范化根路径
///
/// 反斜杠转换为 `/`，去掉 `scheme://` 前缀（如 `s3://`），并去掉末尾分隔符。
/// 对任意输入满足 `normalize(normalize(x)) == normalize(x)`。
pub fn normalize(root: &str) -> String {
    let slashed = BACKSLASHES.replace_all(root, "/");
    let without_scheme = match slashed.rfind("://") {
        Some(idx) => &slashed[idx + 3..],
        None => &slashed[..],
    };
    without_scheme.trim_end_matches('/').to_string()
}

/// 统一分隔符（不处理 scheme 和末尾分隔符）
pub fn to_slash(path: &str) -> String {
    BACKSLASHES.replace_all(path, "/").into_owned()
}

/// 将 `path` 中第一次出现的 `from_root` 替换为 `to_root`
pub fn retarget(path: &str, from_root: &str, to_root: &str) -> String {
    path.replacen(from_root, to_root, 1)
}

/// 拼接路径
pub fn join(base: &str, name: &str) -> String {
    let name = name.trim_start_matches('/');
    if base.is_empty() {
        name.to_string()
    } else if base.ends_with('/') {
        format!("{}{}", base, name)
    } else {
        format!("{}/{}", base, name)
    }
}

/// 父目录（没有父目录时返回空串）
pub fn parent(path: &str) -> &str {
    let path = path.trim_end_matches('/');
    match path.rfind('/') {
        Some(0) => "/",
        Some(idx) => &path[..idx],
        None => "",
    }
}

/// 最后一段路径名
pub fn file_name(path: &str) -> &str {
    let path = path.trim_end_matches('/');
    path.rsplit('/').next().unwrap_or(path)
}

/// 拆分 `bucket/key` 形式的远程路径，key 可能为空
pub fn split_bucket(path: &str) -> (&str, &str) {
    let path = path.trim_start_matches('/');
    match path.split_once('/') {
        Some((bucket, key)) => (bucket, key),
        None => (path, ""),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_strips_scheme_and_separators() {
        assert_eq!(normalize("s3://bucket/prefix/"), "bucket/prefix");
        assert_eq!(normalize("bucket/prefix///"), "bucket/prefix");
        assert_eq!(normalize(r"C:\\data\\photos\"), "C:/data/photos");
        assert_eq!(normalize("/home/user/data"), "/home/user/data");
    }

    #[test]
    fn test_normalize_idempotent() {
        let samples = [
            "s3://bucket/a/b/",
            r"D:\\\\x\\y",
            r"a:\/b",
            "plain",
            "",
            "///",
            "s3://s3://nested/",
            r"\\server\share\",
        ];
        for sample in samples {
            let once = normalize(sample);
            assert_eq!(normalize(&once), once, "input: {:?}", sample);
        }
    }

    #[test]
    fn test_retarget_keeps_suffix() {
        let from = "/data/local";
        let to = "bucket/backup";
        for suffix in ["a.txt", "sub/b.txt", "deep/er/c.bin"] {
            let path = join(from, suffix);
            let mapped = retarget(&path, from, to);
            assert!(mapped.starts_with(to));
            assert_eq!(&mapped[to.len() + 1..], suffix);
        }
    }

    #[test]
    fn test_retarget_only_first_occurrence() {
        assert_eq!(retarget("x/x/x", "x", "y"), "y/x/x");
    }

    #[test]
    fn test_split_bucket() {
        assert_eq!(split_bucket("bucket/a/b.txt"), ("bucket", "a/b.txt"));
        assert_eq!(split_bucket("bucket"), ("bucket", ""));
        assert_eq!(split_bucket("/bucket/x"), ("bucket", "x"));
    }

    #[test]
    fn test_parent_and_file_name() {
        assert_eq!(parent("/tmp/out/a.txt"), "/tmp/out");
        assert_eq!(parent("/a"), "/");
        assert_eq!(parent("a.txt"), "");
        assert_eq!(file_name("bucket/dir/"), "dir");
        assert_eq!(file_name("bucket/dir/a.txt"), "a.txt");
    }
}
