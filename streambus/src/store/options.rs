use crate::envelope::{DATA_KEY, Fields};
use bon::Builder;

/// 追加选项：裁剪策略、显式 ID 与随每条条目携带的附加字段
#[derive(Builder, Clone, Debug, Default)]
pub struct AppendOptions {
    /// 通道不存在时不自动创建（`NOMKSTREAM`）
    #[builder(default)]
    pub no_mk_stream: bool,
    /// 按长度裁剪（`MAXLEN`）
    pub max_len: Option<usize>,
    /// 按最小 ID 裁剪（`MINID`），与 `max_len` 同时设置时以 `max_len` 为准
    #[builder(into)]
    pub min_id: Option<String>,
    /// 近似裁剪（`~`）
    #[builder(default)]
    pub approx: bool,
    /// 近似裁剪时单次最多淘汰的条数（`LIMIT`）
    pub limit: Option<usize>,
    /// 显式条目 ID，缺省由存储生成（`*`）
    #[builder(into)]
    pub id: Option<String>,
    /// 附加字段
    #[builder(default)]
    pub values: Fields,
}

impl AppendOptions {
    /// 近似长度裁剪；`max_len` 为 0 时关闭近似
    pub fn approx_max_len(mut self, max_len: usize) -> Self {
        self.max_len = Some(max_len);
        self.approx = max_len > 0;
        self
    }

    /// 合并附加字段，保留字段 `data` 会被剔除
    pub fn with_values<I, K, V>(mut self, values: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        self.values
            .extend(values.into_iter().map(|(k, v)| (k.into(), v.into())));
        self.values.remove(DATA_KEY);
        self
    }

    /// 显式 ID；`*` 或空值表示交由存储生成
    pub fn explicit_id(&self) -> Option<&str> {
        self.id.as_deref().filter(|id| !id.is_empty() && *id != "*")
    }
}
