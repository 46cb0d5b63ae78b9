use crate::mapping::{field, FieldKind::*, FieldSpec};

pub const INTERN_ROLE_FIELDS: &[FieldSpec] = &[
    field("id", "id", Identifier),
    field("Name", "name", Text),
    field("Role_Title", "role_title", Text),
    field("Contact_Name", "contact_id", LookupId),
    field("Contact_Name", "contact_name", LookupName),
    field("Company", "company_id", LookupId),
    field("Company", "company_name", LookupName),
    field("Status", "status", Text),
    field("Start_Date", "start_date", DateTime),
    field("End_Date", "end_date", DateTime),
    field("Location", "location", Text),
    field("Remote", "remote", Boolean),
    field("Paid", "paid", Boolean),
    field("Hours_per_Week", "hours_per_week", Integer),
    field("Stipend", "stipend", Float),
    field("Required_Skills", "required_skills", JsonList),
    field("Owner", "owner_id", LookupId),
    field("Owner", "owner_name", LookupName),
    field("Description", "description", Text),
    field("Created_Time", "created_time", DateTime),
    field("Modified_Time", "modified_time", DateTime),
];
