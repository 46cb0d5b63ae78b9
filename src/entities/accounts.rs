use crate::mapping::{field, FieldKind::*, FieldSpec};

pub const ACCOUNT_FIELDS: &[FieldSpec] = &[
    field("id", "id", Identifier),
    field("Account_Name", "name", Text),
    field("Account_Type", "account_type", Text),
    field("Industry", "industry", Text),
    field("Website", "website", Text),
    field("Phone", "phone", Text),
    field("Employees", "employees", Integer),
    field("Annual_Revenue", "annual_revenue", Float),
    field("Billing_Street", "billing_street", Text),
    field("Billing_City", "billing_city", Text),
    field("Billing_State", "billing_state", Text),
    field("Billing_Code", "billing_code", Text),
    field("Billing_Country", "billing_country", Text),
    field("Shipping_Street", "shipping_street", Text),
    field("Shipping_City", "shipping_city", Text),
    field("Shipping_Country", "shipping_country", Text),
    field("Parent_Account", "parent_account_id", LookupId),
    field("Parent_Account", "parent_account_name", LookupName),
    field("Owner", "owner_id", LookupId),
    field("Owner", "owner_name", LookupName),
    field("Owner", "owner_email", LookupEmail),
    field("Hiring_Interns", "hiring_interns", Boolean),
    field("Tag", "tag", JsonList),
    field("Description", "description", Text),
    field("Created_Time", "created_time", DateTime),
    field("Modified_Time", "modified_time", DateTime),
];
