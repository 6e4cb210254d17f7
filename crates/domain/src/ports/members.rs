use crate::DomainResult;
use crate::members::MemberRecord;
use crate::ports::BoxFuture;

#[allow(clippy::needless_pass_by_value)]
pub trait MemberRepository: Send + Sync {
    /// Fails with `Conflict` when the id or email is already taken.
    fn create(&self, member: &MemberRecord) -> BoxFuture<'_, DomainResult<MemberRecord>>;

    fn get(&self, member_id: &str) -> BoxFuture<'_, DomainResult<Option<MemberRecord>>>;

    fn find_by_email(&self, email: &str) -> BoxFuture<'_, DomainResult<Option<MemberRecord>>>;

    /// Members whose `belong_to` set contains `company_id`.
    fn list_by_company(&self, company_id: &str) -> BoxFuture<'_, DomainResult<Vec<MemberRecord>>>;

    /// Replaces the stored record; last write wins.
    fn update(&self, member: &MemberRecord) -> BoxFuture<'_, DomainResult<MemberRecord>>;

    fn delete(&self, member_id: &str) -> BoxFuture<'_, DomainResult<()>>;
}
