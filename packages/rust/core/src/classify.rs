//! Feedback classification: a user's raw ratings → one [`FeedbackLabel`].

use chatlake_shared::{FeedbackEntry, FeedbackLabel, RawRating};

/// Classify a user's ratings.
///
/// - no entries, or only unset ratings → `none`
/// - every rating `like` → `like`
/// - every rating `dislike` → `dislike`
/// - anything else (including a rated entry next to an unset one) → `mixed`
pub fn classify_ratings<I>(ratings: I) -> FeedbackLabel
where
    I: IntoIterator<Item = RawRating>,
{
    let (mut like, mut dislike, mut unset) = (false, false, false);
    for rating in ratings {
        match rating {
            RawRating::Like => like = true,
            RawRating::Dislike => dislike = true,
            RawRating::Unset => unset = true,
        }
    }

    match (like, dislike, unset) {
        (false, false, _) => FeedbackLabel::None,
        (true, false, false) => FeedbackLabel::Like,
        (false, true, false) => FeedbackLabel::Dislike,
        _ => FeedbackLabel::Mixed,
    }
}

/// Classify a user's feedback entries by their `raw_rating`.
pub fn classify_feedback<'a, I>(entries: I) -> FeedbackLabel
where
    I: IntoIterator<Item = &'a FeedbackEntry>,
{
    classify_ratings(entries.into_iter().map(|e| e.raw_rating))
}
