//! Relationship edge entity model
//!
//! Directed `(parent_account_id, child_account_id, kind)` edge. The triple is
//! unique; self-loops are rejected before insert.

use sea_orm::entity::prelude::*;
use sea_orm::prelude::DateTimeWithTimeZone;
use uuid::Uuid;

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel)]
#[sea_orm(table_name = "account_relationships")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,

    pub parent_account_id: Uuid,

    pub child_account_id: Uuid,

    /// String form of [`super::RelationshipKind`]
    pub kind: String,

    pub created_at: DateTimeWithTimeZone,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(
        belongs_to = "super::account::Entity",
        from = "Column::ParentAccountId",
        to = "super::account::Column::Id",
        on_delete = "Cascade"
    )]
    Parent,
    #[sea_orm(
        belongs_to = "super::account::Entity",
        from = "Column::ChildAccountId",
        to = "super::account::Column::Id",
        on_delete = "Cascade"
    )]
    Child,
}

impl ActiveModelBehavior for ActiveModel {}
