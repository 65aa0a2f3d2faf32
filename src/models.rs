use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RecurringTaskPeriod {
    Daily,
    Weekly,
    Monthly,
    Quarterly,
    Yearly,
}

impl RecurringTaskPeriod {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Daily => "daily",
            Self::Weekly => "weekly",
            Self::Monthly => "monthly",
            Self::Quarterly => "quarterly",
            Self::Yearly => "yearly",
        }
    }

    pub fn all() -> [RecurringTaskPeriod; 5] {
        [
            Self::Daily,
            Self::Weekly,
            Self::Monthly,
            Self::Quarterly,
            Self::Yearly,
        ]
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Eisen {
    Regular,
    Important,
    Urgent,
    ImportantAndUrgent,
}

impl Eisen {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Regular => "regular",
            Self::Important => "important",
            Self::Urgent => "urgent",
            Self::ImportantAndUrgent => "important-and-urgent",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Difficulty {
    Easy,
    Medium,
    Hard,
}

impl Difficulty {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Easy => "easy",
            Self::Medium => "medium",
            Self::Hard => "hard",
        }
    }

    pub fn score_points(self) -> i64 {
        match self {
            Self::Easy => 1,
            Self::Medium => 2,
            Self::Hard => 5,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", untagged)]
pub enum SkipRule {
    Parity(SkipParity),
    Days(Vec<u32>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SkipParity {
    Even,
    Odd,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct RecurringTaskGenParams {
    pub period: Option<RecurringTaskPeriod>,
    pub eisen: Option<Eisen>,
    pub difficulty: Option<Difficulty>,
    pub actionable_from_day: Option<u32>,
    pub actionable_from_month: Option<u32>,
    pub due_at_day: Option<u32>,
    pub due_at_month: Option<u32>,
    pub skip_rule: Option<SkipRule>,
}

impl RecurringTaskGenParams {
    pub fn for_period(period: RecurringTaskPeriod) -> Self {
        Self {
            period: Some(period),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RepeatsStrategy {
    AllSame,
}

impl RepeatsStrategy {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::AllSame => "all-same",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum InboxTaskStatus {
    NotStartedGen,
    NotStarted,
    InProgress,
    Blocked,
    Done,
    NotDone,
}

impl InboxTaskStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::NotStartedGen => "not-started-gen",
            Self::NotStarted => "not-started",
            Self::InProgress => "in-progress",
            Self::Blocked => "blocked",
            Self::Done => "done",
            Self::NotDone => "not-done",
        }
    }

    pub fn is_completed(self) -> bool {
        matches!(self, Self::Done | Self::NotDone)
    }

    pub fn is_user_touched(self) -> bool {
        !matches!(self, Self::NotStartedGen)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BigPlanStatus {
    NotStartedGen,
    NotStarted,
    InProgress,
    Blocked,
    Done,
    NotDone,
}

impl BigPlanStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::NotStartedGen => "not-started-gen",
            Self::NotStarted => "not-started",
            Self::InProgress => "in-progress",
            Self::Blocked => "blocked",
            Self::Done => "done",
            Self::NotDone => "not-done",
        }
    }

    pub fn is_completed(self) -> bool {
        matches!(self, Self::Done | Self::NotDone)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum InboxTaskSource {
    User,
    Habit,
    Chore,
    BigPlan,
    Metric,
    PersonCatchUp,
    PersonBirthday,
    Journal,
    TimePlan,
    WorkingMemCleanup,
    SlackTask,
    EmailTask,
}

impl InboxTaskSource {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Habit => "habit",
            Self::Chore => "chore",
            Self::BigPlan => "big-plan",
            Self::Metric => "metric",
            Self::PersonCatchUp => "person-catch-up",
            Self::PersonBirthday => "person-birthday",
            Self::Journal => "journal",
            Self::TimePlan => "time-plan",
            Self::WorkingMemCleanup => "working-mem-cleanup",
            Self::SlackTask => "slack-task",
            Self::EmailTask => "email-task",
        }
    }

    pub fn is_generator_owned(self) -> bool {
        matches!(
            self,
            Self::Habit
                | Self::Chore
                | Self::Metric
                | Self::PersonCatchUp
                | Self::PersonBirthday
                | Self::Journal
                | Self::TimePlan
                | Self::WorkingMemCleanup
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ArchivedReason {
    User,
    Gc,
    GenerationReplaced,
}

impl ArchivedReason {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Gc => "gc",
            Self::GenerationReplaced => "generation-replaced",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EntityEventKind {
    Created,
    Updated,
    Archived,
}

impl EntityEventKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Updated => "updated",
            Self::Archived => "archived",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EventSource {
    Cli,
    Web,
    Background,
}

impl EventSource {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Cli => "cli",
            Self::Web => "web",
            Self::Background => "background",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EntityKind {
    Workspace,
    Project,
    Habit,
    Chore,
    Metric,
    Person,
    BigPlan,
    BigPlanMilestone,
    InboxTask,
    Journal,
    TimePlan,
    WorkingMemPrefs,
    JournalSettings,
    TimePlanSettings,
}

impl EntityKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Workspace => "workspace",
            Self::Project => "project",
            Self::Habit => "habit",
            Self::Chore => "chore",
            Self::Metric => "metric",
            Self::Person => "person",
            Self::BigPlan => "big-plan",
            Self::BigPlanMilestone => "big-plan-milestone",
            Self::InboxTask => "inbox-task",
            Self::Journal => "journal",
            Self::TimePlan => "time-plan",
            Self::WorkingMemPrefs => "working-mem-prefs",
            Self::JournalSettings => "journal-settings",
            Self::TimePlanSettings => "time-plan-settings",
        }
    }

    pub fn table(self) -> &'static str {
        match self {
            Self::Workspace => "workspaces",
            Self::Project => "projects",
            Self::Habit => "habits",
            Self::Chore => "chores",
            Self::Metric => "metrics",
            Self::Person => "persons",
            Self::BigPlan => "big_plans",
            Self::BigPlanMilestone => "big_plan_milestones",
            Self::InboxTask => "inbox_tasks",
            Self::Journal => "journals",
            Self::TimePlan => "time_plans",
            Self::WorkingMemPrefs => "working_mem_prefs",
            Self::JournalSettings => "journal_settings",
            Self::TimePlanSettings => "time_plan_settings",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum GenTarget {
    Habits,
    Chores,
    Metrics,
    Persons,
    WorkingMem,
    Journals,
    TimePlans,
}

impl GenTarget {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Habits => "habits",
            Self::Chores => "chores",
            Self::Metrics => "metrics",
            Self::Persons => "persons",
            Self::WorkingMem => "working-mem",
            Self::Journals => "journals",
            Self::TimePlans => "time-plans",
        }
    }

    pub fn all() -> [GenTarget; 7] {
        [
            Self::Habits,
            Self::Chores,
            Self::Metrics,
            Self::Persons,
            Self::WorkingMem,
            Self::Journals,
            Self::TimePlans,
        ]
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StatsTarget {
    Habits,
    BigPlans,
    Journals,
}

impl StatsTarget {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Habits => "habits",
            Self::BigPlans => "big-plans",
            Self::Journals => "journals",
        }
    }

    pub fn all() -> [StatsTarget; 3] {
        [Self::Habits, Self::BigPlans, Self::Journals]
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    pub ref_id: i64,
    pub version: i64,
    pub archived: bool,
    pub archived_reason: Option<ArchivedReason>,
    pub created_time: DateTime<Utc>,
    pub last_modified_time: DateTime<Utc>,
    pub archived_time: Option<DateTime<Utc>>,
}

impl Envelope {
    /// A fresh, unsaved envelope. The store assigns the ref id and bumps
    /// the version on create.
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            ref_id: 0,
            version: 0,
            archived: false,
            archived_reason: None,
            created_time: now,
            last_modified_time: now,
            archived_time: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntityEvent {
    pub id: i64,
    pub entity_kind: EntityKind,
    pub entity_ref_id: i64,
    pub session_index: i64,
    pub kind: EntityEventKind,
    pub source: EventSource,
    pub entity_version: i64,
    pub payload: serde_json::Value,
    pub created_time: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Workspace {
    #[serde(flatten)]
    pub envelope: Envelope,
    pub name: String,
    pub backup_project_ref_id: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Project {
    #[serde(flatten)]
    pub envelope: Envelope,
    pub name: String,
    pub parent_project_ref_id: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Habit {
    #[serde(flatten)]
    pub envelope: Envelope,
    pub name: String,
    pub project_ref_id: i64,
    pub gen_params: RecurringTaskGenParams,
    pub repeats_in_period_count: Option<u32>,
    pub repeats_strategy: Option<RepeatsStrategy>,
    pub suspended: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Chore {
    #[serde(flatten)]
    pub envelope: Envelope,
    pub name: String,
    pub project_ref_id: i64,
    pub gen_params: RecurringTaskGenParams,
    pub start_at_date: Option<NaiveDate>,
    pub end_at_date: Option<NaiveDate>,
    pub must_do: bool,
    pub suspended: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Metric {
    #[serde(flatten)]
    pub envelope: Envelope,
    pub name: String,
    pub unit: Option<String>,
    pub collection_project_ref_id: Option<i64>,
    pub collection_params: Option<RecurringTaskGenParams>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PersonRelationship {
    Family,
    Friend,
    Acquaintance,
    SchoolBuddy,
    WorkBuddy,
    Colleague,
    Other,
}

impl PersonRelationship {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Family => "family",
            Self::Friend => "friend",
            Self::Acquaintance => "acquaintance",
            Self::SchoolBuddy => "school-buddy",
            Self::WorkBuddy => "work-buddy",
            Self::Colleague => "colleague",
            Self::Other => "other",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersonBirthday {
    pub day: u32,
    pub month: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Person {
    #[serde(flatten)]
    pub envelope: Envelope,
    pub name: String,
    pub relationship: PersonRelationship,
    pub catch_up_project_ref_id: Option<i64>,
    pub catch_up_params: Option<RecurringTaskGenParams>,
    pub birthday: Option<PersonBirthday>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BigPlan {
    #[serde(flatten)]
    pub envelope: Envelope,
    pub name: String,
    pub project_ref_id: i64,
    pub status: BigPlanStatus,
    pub eisen: Eisen,
    pub difficulty: Difficulty,
    pub actionable_date: Option<NaiveDate>,
    pub due_date: Option<NaiveDate>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BigPlanMilestone {
    #[serde(flatten)]
    pub envelope: Envelope,
    pub big_plan_ref_id: i64,
    pub date: NaiveDate,
    pub description: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InboxTask {
    #[serde(flatten)]
    pub envelope: Envelope,
    pub name: String,
    pub status: InboxTaskStatus,
    pub project_ref_id: i64,
    pub source: InboxTaskSource,
    pub source_ref_id: Option<i64>,
    pub eisen: Option<Eisen>,
    pub difficulty: Option<Difficulty>,
    pub actionable_date: Option<NaiveDate>,
    pub due_date: Option<NaiveDate>,
    pub completed_time: Option<DateTime<Utc>>,
    pub recurring_timeline: Option<String>,
    pub recurring_repeat_index: Option<i64>,
}

impl InboxTask {
    pub fn recurring_key(&self) -> Option<(InboxTaskSource, i64, String, i64)> {
        match (self.source_ref_id, &self.recurring_timeline) {
            (Some(source_ref_id), Some(timeline)) => Some((
                self.source,
                source_ref_id,
                timeline.clone(),
                self.recurring_repeat_index.unwrap_or(0),
            )),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Journal {
    #[serde(flatten)]
    pub envelope: Envelope,
    pub right_now: NaiveDate,
    pub period: RecurringTaskPeriod,
    pub timeline: String,
    pub sources: Vec<InboxTaskSource>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TimePlanSource {
    User,
    Generated,
}

impl TimePlanSource {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Generated => "generated",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimePlan {
    #[serde(flatten)]
    pub envelope: Envelope,
    pub right_now: NaiveDate,
    pub period: RecurringTaskPeriod,
    pub timeline: String,
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
    pub source: TimePlanSource,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkingMemPrefs {
    #[serde(flatten)]
    pub envelope: Envelope,
    pub generation_period: RecurringTaskPeriod,
    pub cleanup_project_ref_id: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum JournalGenerationApproach {
    None,
    OnlyJournal,
    BothJournalAndTask,
}

impl JournalGenerationApproach {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::None => "none",
            Self::OnlyJournal => "only-journal",
            Self::BothJournalAndTask => "both-journal-and-task",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JournalSettings {
    #[serde(flatten)]
    pub envelope: Envelope,
    pub generation_approach: JournalGenerationApproach,
    pub periods: Vec<RecurringTaskPeriod>,
    pub sources: Vec<InboxTaskSource>,
    pub writing_task_project_ref_id: i64,
    pub writing_task_eisen: Option<Eisen>,
    pub writing_task_difficulty: Option<Difficulty>,
    pub days_until_gc: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TimePlanGenerationApproach {
    None,
    OnlyTimePlan,
    BothTimePlanAndTask,
}

impl TimePlanGenerationApproach {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::None => "none",
            Self::OnlyTimePlan => "only-time-plan",
            Self::BothTimePlanAndTask => "both-time-plan-and-task",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimePlanSettings {
    #[serde(flatten)]
    pub envelope: Envelope,
    pub generation_approach: TimePlanGenerationApproach,
    pub periods: Vec<RecurringTaskPeriod>,
    pub planning_task_project_ref_id: i64,
    pub planning_task_eisen: Option<Eisen>,
    pub planning_task_difficulty: Option<Difficulty>,
    pub days_until_gc: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum HabitStreakStatus {
    Done,
    NotDone,
    Missed,
    Scheduled,
}

impl HabitStreakStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Done => "done",
            Self::NotDone => "not-done",
            Self::Missed => "missed",
            Self::Scheduled => "scheduled",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HabitStreakMark {
    pub habit_ref_id: i64,
    pub year: i32,
    pub date: NaiveDate,
    pub statuses: Vec<HabitStreakStatus>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BigPlanStats {
    pub big_plan_ref_id: i64,
    pub all_inbox_tasks_cnt: i64,
    pub completed_inbox_tasks_cnt: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JournalStats {
    pub journal_ref_id: i64,
    pub report: serde_json::Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ScoreSource {
    InboxTask,
    BigPlan,
}

impl ScoreSource {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::InboxTask => "inbox-task",
            Self::BigPlan => "big-plan",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScoreLogEntry {
    pub id: i64,
    pub created_time: DateTime<Utc>,
    pub source: ScoreSource,
    pub source_entity_ref_id: i64,
    pub difficulty: Option<Difficulty>,
    pub score_delta: i64,
    pub had_lucky_puppy_bonus: bool,
    pub timeline_daily: String,
    pub timeline_weekly: String,
    pub timeline_monthly: String,
    pub timeline_quarterly: String,
    pub timeline_yearly: String,
}

impl ScoreLogEntry {
    pub fn timeline_for(&self, period: RecurringTaskPeriod) -> &str {
        match period {
            RecurringTaskPeriod::Daily => &self.timeline_daily,
            RecurringTaskPeriod::Weekly => &self.timeline_weekly,
            RecurringTaskPeriod::Monthly => &self.timeline_monthly,
            RecurringTaskPeriod::Quarterly => &self.timeline_quarterly,
            RecurringTaskPeriod::Yearly => &self.timeline_yearly,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScorePeriodBest {
    pub period: Option<RecurringTaskPeriod>,
    pub timeline: String,
    pub sub_period: RecurringTaskPeriod,
    pub total_score: i64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TargetCounts {
    pub created: usize,
    pub updated: usize,
    pub archived: usize,
    pub removed: usize,
    pub errors: Vec<String>,
}

impl TargetCounts {
    pub fn merge(&mut self, other: &TargetCounts) {
        self.created += other.created;
        self.updated += other.updated;
        self.archived += other.archived;
        self.removed += other.removed;
        self.errors.extend(other.errors.iter().cloned());
    }

    pub fn is_noop(&self) -> bool {
        self.created == 0
            && self.updated == 0
            && self.archived == 0
            && self.removed == 0
            && self.errors.is_empty()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenLogEntry {
    pub id: i64,
    pub created_time: DateTime<Utc>,
    pub source: EventSource,
    pub today: NaiveDate,
    pub gen_even_if_not_modified: bool,
    pub targets: Vec<GenTarget>,
    pub period_filter: Option<Vec<RecurringTaskPeriod>>,
    pub filter_ref_ids: serde_json::Value,
    pub per_target_counts: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GcLogEntry {
    pub id: i64,
    pub created_time: DateTime<Utc>,
    pub source: EventSource,
    pub today: NaiveDate,
    pub targets: Vec<GenTarget>,
    pub filter_ref_ids: serde_json::Value,
    pub per_target_counts: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScheduleExternalSyncLogEntry {
    pub id: i64,
    pub created_time: DateTime<Utc>,
    pub stream_ref_id: i64,
    pub sync_start: Option<NaiveDate>,
    pub sync_end: Option<NaiveDate>,
    pub entities_upserted: i64,
    pub even_more_entity_records: bool,
    pub errors: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScheduleExternalEvent {
    pub id: i64,
    pub stream_ref_id: i64,
    pub external_uid: String,
    pub name: String,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub last_synced_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatsSummary {
    pub habits_refreshed: usize,
    pub streak_marks_upserted: usize,
    pub big_plans_refreshed: usize,
    pub journals_refreshed: usize,
    pub errors: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationFilters {
    pub habit_ref_ids: Option<Vec<i64>>,
    pub chore_ref_ids: Option<Vec<i64>>,
    pub metric_ref_ids: Option<Vec<i64>>,
    pub person_ref_ids: Option<Vec<i64>>,
    pub big_plan_ref_ids: Option<Vec<i64>>,
    pub journal_ref_ids: Option<Vec<i64>>,
}

impl GenerationFilters {
    pub fn allows(filter: &Option<Vec<i64>>, ref_id: i64) -> bool {
        match filter {
            Some(ids) => ids.contains(&ref_id),
            None => true,
        }
    }
}
