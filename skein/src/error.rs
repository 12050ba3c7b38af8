pub type SkeinResult<T> = Result<T, SkeinError>;

pub type SkeinError = eyre::Report;
