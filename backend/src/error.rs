use thiserror::Error;

/// 后端提交失败的分类，决定协调器的重试/死信策略。
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SubmitFailure {
    /// 网络/超时类错误，可安全重试。
    #[error("transient failure: {0}")]
    Transient(String),
    /// 后端明确拒绝，不重试。
    #[error("rejected: {0}")]
    Rejected(String),
    /// 结果不确定（可能已生效），按 transient 处理但重试上限更低。
    #[error("unknown outcome: {0}")]
    Unknown(String),
}

impl SubmitFailure {
    pub fn is_retryable(&self) -> bool {
        !matches!(self, Self::Rejected(_))
    }

    pub fn is_unknown(&self) -> bool {
        matches!(self, Self::Unknown(_))
    }

    pub fn message(&self) -> &str {
        match self {
            Self::Transient(msg) | Self::Rejected(msg) | Self::Unknown(msg) => msg,
        }
    }
}
